//! Reload logic for runtime filter changes

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing_subscriber::{EnvFilter, Registry, layer::Layer};

use crate::error::{LogError, LogResult};

/// Handle for swapping the filter of a running logger.
#[derive(Clone)]
pub struct ReloadHandle {
    filter: tracing_subscriber::reload::Handle<EnvFilter, Registry>,
    current_filter: Arc<ArcSwap<String>>,
}

impl std::fmt::Debug for ReloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadHandle")
            .field("current_filter", &self.current_filter.load())
            .finish_non_exhaustive()
    }
}

impl ReloadHandle {
    /// Replace the log filter.
    ///
    /// # Errors
    /// Returns error if the directive does not parse or the subscriber is gone.
    pub fn reload(&self, filter: &str) -> LogResult<()> {
        let new_filter = EnvFilter::try_new(filter).map_err(|e| LogError::Filter {
            filter: filter.to_string(),
            reason: e.to_string(),
        })?;
        self.filter
            .reload(new_filter)
            .map_err(|e| LogError::Config(format!("failed to reload filter: {e}")))?;
        self.current_filter.store(Arc::new(filter.to_string()));
        Ok(())
    }

    /// The directive currently in force.
    #[must_use]
    pub fn current_filter(&self) -> Arc<String> {
        self.current_filter.load_full()
    }
}

/// The filter layer, wrapped for reloading when asked to.
pub(super) fn create_filter_layer(
    filter: EnvFilter,
    level: &str,
    reloadable: bool,
) -> (
    Box<dyn Layer<Registry> + Send + Sync + 'static>,
    Option<ReloadHandle>,
) {
    if reloadable {
        let (layer, handle) = tracing_subscriber::reload::Layer::new(filter);
        let reload_handle = ReloadHandle {
            filter: handle,
            current_filter: Arc::new(ArcSwap::from_pointee(level.to_string())),
        };
        (Box::new(layer), Some(reload_handle))
    } else {
        (Box::new(filter), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_filter_has_no_handle() {
        let (_, handle) = create_filter_layer(EnvFilter::new("info"), "info", false);
        assert!(handle.is_none());
    }

    #[test]
    fn reloadable_filter_tracks_directive() {
        let (_layer, handle) = create_filter_layer(EnvFilter::new("info"), "info", true);
        let handle = handle.unwrap();
        assert_eq!(*handle.current_filter(), "info");
        assert!(handle.reload("weft=loud").is_err());
        assert_eq!(*handle.current_filter(), "info");
    }
}
