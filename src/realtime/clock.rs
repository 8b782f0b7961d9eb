use crate::core::errors::TransportError;
use crate::core::kernel::signature::ElapsedSource;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

struct Anchor {
    value: u64,
    at: Instant,
}

/// Server elapsed-realtime clock, fetched once and extrapolated locally
pub struct ElapsedClock {
    source: Arc<dyn ElapsedSource>,
    anchor: Mutex<Option<Anchor>>,
}

impl ElapsedClock {
    pub fn new(source: Arc<dyn ElapsedSource>) -> Self {
        Self {
            source,
            anchor: Mutex::new(None),
        }
    }

    /// Current value: the fetched value plus the local time since it was read
    pub async fn read(&self) -> Result<u64, TransportError> {
        let mut anchor = self.anchor.lock().await;
        let now = Instant::now();

        let value = match anchor.as_ref() {
            Some(previous) => {
                let delta = now.duration_since(previous.at).as_millis();
                previous
                    .value
                    .saturating_add(u64::try_from(delta).unwrap_or(u64::MAX))
            }
            None => {
                let value = self.source.elapsed_realtime().await?;
                debug!(elapsed = value, "Fetched elapsed realtime");
                value
            }
        };

        *anchor = Some(Anchor { value, at: now });
        Ok(value)
    }

    pub async fn is_primed(&self) -> bool {
        self.anchor.lock().await.is_some()
    }
}

impl std::fmt::Debug for ElapsedClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElapsedClock").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kernel::fakes::FakeSignatureService;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_extrapolates_without_refetch() {
        let source = Arc::new(FakeSignatureService::signing("s").with_elapsed(5_000));
        let clock = ElapsedClock::new(source.clone());
        assert!(!clock.is_primed().await);

        assert_eq!(clock.read().await.unwrap(), 5_000);
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(clock.read().await.unwrap(), 6_500);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(clock.read().await.unwrap(), 6_750);

        assert_eq!(source.elapsed_calls(), 1);
    }
}
