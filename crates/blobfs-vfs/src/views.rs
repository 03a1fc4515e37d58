//! Activity tracking and the policies behind `recent/` and `date/`.
//!
//! Both views are pure functions of an [`ActivityLog`] snapshot, so the
//! selection policy can be swapped without touching the resolver or the
//! directory synthesizer.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::SystemTime;

use blobfs_cas::Digest;
use chrono::{DateTime, NaiveDate, Utc};

/// One committed file version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    pub root: String,
    /// Slash-separated path inside the root.
    pub path: String,
    pub digest: Digest,
    pub size: u64,
    pub time: SystemTime,
}

impl Activity {
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Bounded, append-only record of commits, oldest first.
#[derive(Debug)]
pub struct ActivityLog {
    capacity: usize,
    events: Mutex<VecDeque<Activity>>,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, activity: Activity) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(activity);
    }

    pub fn snapshot(&self) -> Vec<Activity> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A file shown in a synthetic view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry {
    pub name: String,
    pub digest: Digest,
    pub size: u64,
    pub time: SystemTime,
}

/// Chooses and orders the contents of `recent/`.
pub trait RecentPolicy: Send + Sync {
    fn select(&self, events: &[Activity]) -> Vec<ViewEntry>;
}

/// Assigns commits to the buckets listed under `date/`.
pub trait DatePolicy: Send + Sync {
    fn bucket(&self, time: SystemTime) -> String;

    /// Whether `name` is a well-formed bucket name.
    fn is_bucket(&self, name: &str) -> bool;
}

/// The newest version of each file, newest first, capped at `limit`.
///
/// Ties on time are broken by root then path so the listing is stable.
#[derive(Debug, Clone, Copy)]
pub struct RecentWindow {
    pub limit: usize,
}

impl RecentPolicy for RecentWindow {
    fn select(&self, events: &[Activity]) -> Vec<ViewEntry> {
        let mut latest = latest_per_file(events.iter());
        latest.sort_by(|a, b| {
            b.time
                .cmp(&a.time)
                .then_with(|| a.root.cmp(&b.root))
                .then_with(|| a.path.cmp(&b.path))
        });
        latest.truncate(self.limit);
        name_entries(latest)
    }
}

/// One bucket per UTC calendar day, named `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DailyBuckets;

impl DatePolicy for DailyBuckets {
    fn bucket(&self, time: SystemTime) -> String {
        DateTime::<Utc>::from(time).format("%Y-%m-%d").to_string()
    }

    fn is_bucket(&self, name: &str) -> bool {
        NaiveDate::parse_from_str(name, "%Y-%m-%d").is_ok()
    }
}

/// Bucket names present in `events`, sorted.
pub fn date_buckets(policy: &dyn DatePolicy, events: &[Activity]) -> BTreeSet<String> {
    events.iter().map(|e| policy.bucket(e.time)).collect()
}

/// Files whose latest commit within `bucket` happened there, sorted by name.
pub fn bucket_entries(policy: &dyn DatePolicy, events: &[Activity], bucket: &str) -> Vec<ViewEntry> {
    let in_bucket = events.iter().filter(|e| policy.bucket(e.time) == bucket);
    let mut latest = latest_per_file(in_bucket);
    latest.sort_by(|a, b| a.root.cmp(&b.root).then_with(|| a.path.cmp(&b.path)));
    let mut entries = name_entries(latest);
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

/// Keep the last event per `(root, path)`; `events` is oldest first.
fn latest_per_file<'a>(events: impl Iterator<Item = &'a Activity>) -> Vec<&'a Activity> {
    let mut latest: BTreeMap<(&str, &str), &Activity> = BTreeMap::new();
    for event in events {
        latest.insert((event.root.as_str(), event.path.as_str()), event);
    }
    latest.into_values().collect()
}

/// Give each entry a unique name, in order: the first holder of a file
/// name keeps it, later ones are prefixed with a short digest.
fn name_entries(events: Vec<&Activity>) -> Vec<ViewEntry> {
    let mut taken = HashSet::new();
    let mut out = Vec::with_capacity(events.len());
    for event in events {
        let plain = event.file_name().to_string();
        let name = if !taken.contains(&plain) {
            plain
        } else {
            let short = format!("{}-{}", &event.digest.to_hex()[..8], plain);
            if taken.contains(&short) {
                format!("{}-{}", event.digest, plain)
            } else {
                short
            }
        };
        taken.insert(name.clone());
        out.push(ViewEntry {
            name,
            digest: event.digest,
            size: event.size,
            time: event.time,
        });
    }
    out
}
