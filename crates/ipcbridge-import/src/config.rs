use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ipcbridge_wire::RemoteError;

/// Builds a local error value from a remote error with a known name.
pub type ErrorConstructor =
    Arc<dyn Fn(&RemoteError) -> Box<dyn StdError + Send + Sync> + Send + Sync>;

/// Maps remote error names to local constructors.
///
/// When a remote error arrives whose name is registered here, the importer
/// builds the typed error and attaches it to the [`RemoteError`], where it can
/// be recovered with [`RemoteError::downcast_ref`].
#[derive(Clone, Default)]
pub struct ErrorRegistry {
    constructors: HashMap<String, ErrorConstructor>,
}

impl ErrorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F, E>(mut self, name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&RemoteError) -> E + Send + Sync + 'static,
        E: StdError + Send + Sync + 'static,
    {
        self.register(name, constructor);
        self
    }

    pub fn register<F, E>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&RemoteError) -> E + Send + Sync + 'static,
        E: StdError + Send + Sync + 'static,
    {
        self.constructors.insert(
            name.into(),
            Arc::new(move |remote: &RemoteError| {
                Box::new(constructor(remote)) as Box<dyn StdError + Send + Sync>
            }),
        );
    }

    pub fn get(&self, name: &str) -> Option<&ErrorConstructor> {
        self.constructors.get(name)
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl fmt::Debug for ErrorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}

/// Importer configuration.
#[derive(Debug, Clone, Default)]
pub struct ImportConfig {
    /// Deadline for `async` and `promise` calls. `None` waits forever.
    pub timeout: Option<Duration>,
    pub errors: ErrorRegistry,
}

impl ImportConfig {
    /// A zero duration disables the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_errors(mut self, errors: ErrorRegistry) -> Self {
        self.errors = errors;
        self
    }

    pub(crate) fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| !t.is_zero())
    }
}
