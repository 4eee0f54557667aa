use std::fmt::Display;
use std::future::Future;

use tracing::{debug, warn};
use uuid::Uuid;

/// Independent best-effort steps. A failing step is logged and the next one still runs.
pub struct Cleanup {
    scope: &'static str,
    entity_id: Uuid,
    failed: Vec<&'static str>,
}

impl Cleanup {
    pub fn new(scope: &'static str, entity_id: Uuid) -> Self {
        Self {
            scope,
            entity_id,
            failed: Vec::new(),
        }
    }

    pub async fn step<T, E, F>(&mut self, name: &'static str, fut: F) -> Option<T>
    where
        E: Display,
        F: Future<Output = std::result::Result<T, E>>,
    {
        match fut.await {
            Ok(value) => {
                debug!(scope = self.scope, entity_id = %self.entity_id, step = name, "cleanup step done");
                Some(value)
            }
            Err(e) => {
                warn!(scope = self.scope, entity_id = %self.entity_id, step = name, error = %e, "cleanup step failed, continuing");
                self.failed.push(name);
                None
            }
        }
    }

    /// Names of the steps that failed, in order.
    pub fn finish(self) -> Vec<&'static str> {
        if !self.failed.is_empty() {
            warn!(scope = self.scope, entity_id = %self.entity_id, failed = ?self.failed, "cleanup finished with failures");
        }
        self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failing_step_does_not_stop_the_rest() {
        let mut cleanup = Cleanup::new("test", Uuid::nil());
        let first = cleanup.step("first", async { Err::<(), _>("boom") }).await;
        let second = cleanup.step("second", async { Ok::<_, String>(7) }).await;

        assert_eq!(first, None);
        assert_eq!(second, Some(7));
        assert_eq!(cleanup.finish(), vec!["first"]);
    }
}
