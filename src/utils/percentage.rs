use std::{fmt::Display, ops::Deref, str::FromStr};

use anyhow::anyhow;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Percentage(f64);

impl Display for Percentage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%", self.0)
    }
}

impl Percentage {
    pub fn new_opt(value: f64) -> Option<Percentage> {
        if value < 0. || value.is_nan() {
            None
        } else {
            Some(Percentage(value))
        }
    }
}

impl FromStr for Percentage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // This means that 100%% also works, but I think I'm fine with that
        let s = s.trim_end_matches("%");
        let v = s.parse::<f64>()?;
        Percentage::new_opt(v).ok_or_else(|| anyhow!("Can't parse {s} into percentage"))
    }
}

impl Deref for Percentage {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Share of `value_ms` in `whole_ms`. An empty whole yields 0%.
pub fn ms_percentage(value_ms: u64, whole_ms: u64) -> Percentage {
    if whole_ms == 0 {
        return Percentage(0.);
    }
    Percentage(value_ms as f64 / whole_ms as f64 * 100.)
}

#[cfg(test)]
mod tests {
    use super::{ms_percentage, Percentage};

    #[test]
    fn test_parse_percentage() {
        assert_eq!(*"12.5%".parse::<Percentage>().unwrap(), 12.5);
        assert_eq!(*"3".parse::<Percentage>().unwrap(), 3.);
        assert!("-1%".parse::<Percentage>().is_err());
    }

    #[test]
    fn test_ms_percentage() {
        assert_eq!(*ms_percentage(250, 1000), 25.);
        assert_eq!(*ms_percentage(5, 0), 0.);
    }
}
