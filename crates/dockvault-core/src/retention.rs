use crate::config::Retention;
use crate::model::ArchiveEntry;
use std::collections::BTreeMap;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Rule {
    fn period(self, ts: OffsetDateTime) -> (i32, u32) {
        match self {
            Rule::Daily => (ts.year(), u32::from(ts.ordinal())),
            Rule::Weekly => {
                let (year, week, _) = ts.to_iso_week_date();
                (year, u32::from(week))
            }
            Rule::Monthly => (ts.year(), u32::from(u8::from(ts.month()))),
            Rule::Yearly => (ts.year(), 0),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Rule::Daily => "daily",
            Rule::Weekly => "weekly",
            Rule::Monthly => "monthly",
            Rule::Yearly => "yearly",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kept {
    pub name: String,
    pub rule: Rule,
    /// Kept only because the rule ran out of archives before its count.
    pub oldest: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrunePlan {
    pub keep: Vec<Kept>,
    pub prune: Vec<String>,
}

/// Which archives a prune with `retention` keeps, newest first.
///
/// Rules run daily, weekly (ISO weeks), monthly, yearly. Each walks the
/// archives newest first and keeps the first archive of every period it has
/// not seen; an archive kept by an earlier rule consumes the period without
/// counting. A rule that runs out of archives keeps the oldest one.
pub fn plan_prune(archives: &[ArchiveEntry], retention: &Retention) -> PrunePlan {
    let mut sorted: Vec<&ArchiveEntry> = archives.iter().collect();
    sorted.sort_by(|a, b| b.start.cmp(&a.start).then_with(|| b.name.cmp(&a.name)));

    let mut kept: BTreeMap<&str, Kept> = BTreeMap::new();
    let rules = [
        (Rule::Daily, retention.keep_daily),
        (Rule::Weekly, retention.keep_weekly),
        (Rule::Monthly, retention.keep_monthly),
        (Rule::Yearly, retention.keep_yearly),
    ];
    for (rule, count) in rules {
        if count == 0 {
            continue;
        }
        let mut last = None;
        let mut taken = 0u32;
        let mut reached = false;
        for archive in sorted.iter().copied() {
            let period = rule.period(archive.start);
            if last == Some(period) {
                continue;
            }
            last = Some(period);
            if kept.contains_key(archive.name.as_str()) {
                continue;
            }
            kept.insert(
                archive.name.as_str(),
                Kept {
                    name: archive.name.clone(),
                    rule,
                    oldest: false,
                },
            );
            taken += 1;
            if taken == count {
                reached = true;
                break;
            }
        }
        if !reached {
            if let Some(oldest) = sorted.last().copied() {
                kept.entry(oldest.name.as_str()).or_insert_with(|| Kept {
                    name: oldest.name.clone(),
                    rule,
                    oldest: true,
                });
            }
        }
    }

    let mut plan = PrunePlan::default();
    for archive in sorted {
        match kept.remove(archive.name.as_str()) {
            Some(k) => plan.keep.push(k),
            None => plan.prune.push(archive.name.clone()),
        }
    }
    plan
}
