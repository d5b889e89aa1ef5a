//!  Storage is organized in layers:
//!   - [kv::KeyValueStore] holds opaque JSON values by key. The file backend keeps one file per
//!     key in the application directory.
//!   - Values are sealed by [crate::crypto::store::EncryptedStore] before they reach it.
//!   - [ledger::TimeLedger] owns the `usage:<date>` day buckets, [settings] owns `settings:*`.

pub mod entities;
pub mod kv;
pub mod ledger;
pub mod locks;
pub mod settings;
