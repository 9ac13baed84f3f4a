//! Mutation audit log.

use tracing::{info, warn};

use crate::driver::hooks::{DriverHooks, Outcome};

/// Log every mutation once its outcome is known.
pub fn register(hooks: &DriverHooks) {
    for kind in DriverHooks::KINDS {
        hooks.for_kind(kind).on_after(|event, outcome| async move {
            let source = event
                .source
                .as_ref()
                .map(|s| s.path.display().to_string());
            match outcome {
                Outcome::Completed(delta) => info!(
                    op = event.kind.as_str(),
                    id = %event.id,
                    volume = event.target.volume.id(),
                    path = %event.target.path.display(),
                    source = ?source,
                    delta = delta.target,
                    "Mutation completed"
                ),
                Outcome::Failed(reason) => warn!(
                    op = event.kind.as_str(),
                    id = %event.id,
                    path = %event.target.path.display(),
                    error = %reason,
                    "Mutation failed"
                ),
                Outcome::Vetoed => info!(
                    op = event.kind.as_str(),
                    id = %event.id,
                    path = %event.target.path.display(),
                    "Mutation vetoed"
                ),
            }
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_covers_every_kind() {
        let hooks = DriverHooks::default();
        register(&hooks);
        for kind in DriverHooks::KINDS {
            assert_eq!(hooks.for_kind(kind).after_count(), 1);
            assert_eq!(hooks.for_kind(kind).before_count(), 0);
        }
    }
}
