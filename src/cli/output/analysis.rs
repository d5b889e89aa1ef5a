use chrono::{DateTime, Utc};

use crate::{
    api::messages::WebsiteUsage,
    utils::percentage::{ms_percentage, Percentage},
};

#[derive(Debug, Clone, PartialEq)]
pub struct DomainShare {
    pub domain: String,
    pub time_ms: u64,
    pub visits: u64,
    pub last_visited: DateTime<Utc>,
    pub share: Percentage,
}

/// Returns domains holding at least `min_percentage` of `total_ms`, longest first, plus the
/// time of the domains that were filtered out.
pub fn rank_domains(
    websites: &[WebsiteUsage],
    total_ms: u64,
    min_percentage: Percentage,
) -> (Vec<DomainShare>, u64) {
    let mut hidden_ms = 0;
    let mut shares = vec![];
    for site in websites {
        let share = ms_percentage(site.time_spent, total_ms);
        if *share < *min_percentage {
            hidden_ms += site.time_spent;
            continue;
        }
        shares.push(DomainShare {
            domain: site.domain.clone(),
            time_ms: site.time_spent,
            visits: site.visit_count,
            last_visited: site.last_visited,
            share,
        });
    }
    shares.sort_by(|a, b| b.time_ms.cmp(&a.time_ms).then_with(|| a.domain.cmp(&b.domain)));
    (shares, hidden_ms)
}
