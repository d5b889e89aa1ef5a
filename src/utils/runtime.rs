use anyhow::Result;

/// All tracking work runs cooperatively on one thread; see the daemon module.
pub fn single_thread_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}
