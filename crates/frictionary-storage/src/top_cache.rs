use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use frictionary_core::Suggestion;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

use crate::store::StoreError;

type TopList = Arc<Vec<Suggestion>>;

struct CacheSlot {
    created: Instant,
    cell: Arc<OnceCell<TopList>>,
}

/// TTL cache of top-by-score lists keyed by `(site, limit)`.
///
/// Each slot holds a `OnceCell`; callers arriving while a load is in flight wait on
/// it instead of issuing their own query. A failed load leaves the cell empty so
/// the next caller retries.
pub(crate) struct TopScoreCache {
    ttl: Duration,
    slots: Mutex<HashMap<(String, usize), CacheSlot>>,
}

impl TopScoreCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn get_or_load<F, Fut>(
        &self,
        site: &str,
        limit: usize,
        load: F,
    ) -> Result<TopList, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Suggestion>, StoreError>>,
    {
        let cell = {
            let mut slots = self.slots.lock().await;
            let key = (site.to_string(), limit);
            match slots.get(&key) {
                Some(slot) if slot.created.elapsed() < self.ttl => slot.cell.clone(),
                _ => {
                    let cell = Arc::new(OnceCell::new());
                    slots.insert(
                        key,
                        CacheSlot {
                            created: Instant::now(),
                            cell: cell.clone(),
                        },
                    );
                    cell
                }
            }
        };

        cell.get_or_try_init(|| async { load().await.map(Arc::new) })
            .await
            .cloned()
    }
}
