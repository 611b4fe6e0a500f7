//! # Worker definitions.
//!
//! A [`WorkerDefinition`] declares how many processes of one kind the master
//! keeps alive, under which identity they run, and which callbacks and reload
//! strategies they execute.
//!
//! ## Rules
//! - Definitions are immutable once registered; the pool assigns their `id`.
//! - Ids are assigned in registration order starting at 1, so a re-executed
//!   child that registers the same definitions finds its own by id.
//! - `count = 0` is allowed and spawns nothing.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::reload::ReloadStrategy;
use crate::workers::worker::WorkerRef;

/// Static description of one kind of worker process.
#[derive(Clone)]
pub struct WorkerDefinition {
    id: u32,
    name: Cow<'static, str>,
    count: usize,
    reloadable: bool,
    user: Option<String>,
    group: Option<String>,
    worker: WorkerRef,
    strategies: Vec<Arc<dyn ReloadStrategy>>,
}

impl WorkerDefinition {
    /// Starts a definition of one reloadable process running `worker`.
    pub fn builder(name: impl Into<Cow<'static, str>>, worker: WorkerRef) -> WorkerDefinitionBuilder {
        WorkerDefinitionBuilder {
            def: WorkerDefinition {
                id: 0,
                name: name.into(),
                count: 1,
                reloadable: true,
                user: None,
                group: None,
                worker,
                strategies: Vec::new(),
            },
        }
    }

    /// Pool-assigned id (`0` until registered).
    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// Definition name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Desired number of live processes.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether processes accept the reload signal.
    pub fn reloadable(&self) -> bool {
        self.reloadable
    }

    /// User to switch to in the child.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Group to switch to in the child.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Lifecycle callbacks.
    pub fn worker(&self) -> &WorkerRef {
        &self.worker
    }

    /// Reload strategies, in evaluation order.
    pub fn strategies(&self) -> &[Arc<dyn ReloadStrategy>] {
        &self.strategies
    }
}

impl fmt::Debug for WorkerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("count", &self.count)
            .field("reloadable", &self.reloadable)
            .field("user", &self.user)
            .field("group", &self.group)
            .field("strategies", &self.strategies.len())
            .finish()
    }
}

/// Builder of [`WorkerDefinition`].
pub struct WorkerDefinitionBuilder {
    def: WorkerDefinition,
}

impl WorkerDefinitionBuilder {
    /// Sets the desired number of processes.
    pub fn count(mut self, count: usize) -> Self {
        self.def.count = count;
        self
    }

    /// Sets whether processes take part in reloads.
    pub fn reloadable(mut self, reloadable: bool) -> Self {
        self.def.reloadable = reloadable;
        self
    }

    /// Runs processes as `user`, with the user's primary group unless
    /// [`group`](Self::group) is set.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.def.user = Some(user.into());
        self
    }

    /// Runs processes with `group` as primary group.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.def.group = Some(group.into());
        self
    }

    /// Appends a reload strategy.
    pub fn strategy(mut self, strategy: impl ReloadStrategy) -> Self {
        self.def.strategies.push(Arc::new(strategy));
        self
    }

    /// Finishes the definition.
    pub fn build(self) -> WorkerDefinition {
        self.def
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::reload::{MaxRequests, OnException};
    use crate::runtime::WorkerContext;
    use crate::workers::WorkerFn;

    #[test]
    fn builder_sets_every_field() {
        let worker: WorkerRef = WorkerFn::arc(|_ctx: WorkerContext| async {
            Ok::<_, WorkerError>(())
        });
        let def = WorkerDefinition::builder("http", worker)
            .count(3)
            .reloadable(false)
            .user("www")
            .group("www-data")
            .strategy(OnException::any())
            .strategy(MaxRequests::new(100))
            .build();

        assert_eq!(def.id(), 0);
        assert_eq!(def.name(), "http");
        assert_eq!(def.count(), 3);
        assert!(!def.reloadable());
        assert_eq!(def.user(), Some("www"));
        assert_eq!(def.group(), Some("www-data"));
        let names: Vec<_> = def.strategies().iter().map(|s| s.name()).collect();
        assert_eq!(names, ["on_exception", "max_requests"]);
        assert_eq!(def.with_id(4).id(), 4);
    }
}
