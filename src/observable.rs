//! Observable Values
//!
//! Reactive values using `tokio::sync::watch` for multi-subscriber
//! notifications, optionally mirrored onto a [`ChangeBroadcaster`] so that
//! every change is also announced to remote observers.
//!
//! # Features
//!
//! - Type-safe observable values with automatic change notifications
//! - Multi-subscriber support (local watchers, remote attribute subscribers)
//! - Values only their owning engine may change
//! - Metadata (name, units, description)
//! - Generic JSON access via the [`ParameterBase`] trait
//!
//! # Example
//!
//! ```rust,ignore
//! let progress = Observable::new("progress", 0u8)
//!     .with_units("%")
//!     .with_broadcaster("motor-1", bus.clone());
//!
//! let mut rx = progress.subscribe();
//! tokio::spawn(async move {
//!     while rx.changed().await.is_ok() {
//!         println!("Progress: {}", *rx.borrow());
//!     }
//! });
//!
//! // Owner-side update, announced on the bus
//! progress.set(40);
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

use crate::notify::{AttributeEvent, ChangeBroadcaster};

// =============================================================================
// ParameterBase Trait - Generic Access
// =============================================================================

/// Base trait for all observables, providing type-erased access to common operations.
///
/// This enables generic attribute reads (e.g. `read_attribute("...")` on an
/// engine) without knowing the concrete value type at compile time.
pub trait ParameterBase: Send + Sync {
    /// Get the parameter name
    fn name(&self) -> &str;

    /// Get the current value as JSON
    fn get_json(&self) -> Result<serde_json::Value>;

    /// Get the parameter metadata
    fn metadata(&self) -> &ObservableMetadata;
}

// =============================================================================
// Observable<T>
// =============================================================================

type Announcer<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A thread-safe, observable value with change notifications.
///
/// Uses `tokio::sync::watch` internally for efficient multi-subscriber broadcast.
/// Local subscribers only see the latest value; attach a broadcaster with
/// [`Observable::with_broadcaster`] when every intermediate value matters.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    sender: watch::Sender<T>,
    metadata: ObservableMetadata,
    announcer: Option<Announcer<T>>,
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("metadata", &self.metadata)
            .field("announced", &self.announcer.is_some())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(), // shares the same watch channel
            metadata: self.metadata.clone(),
            announcer: self.announcer.clone(),
        }
    }
}

/// Metadata for an observable value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservableMetadata {
    /// Attribute name (unique within its owner)
    pub name: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Units (e.g., "%", "ms")
    pub units: Option<String>,
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self {
            sender,
            metadata: ObservableMetadata {
                name: name.into(),
                description: None,
                units: None,
            },
            announcer: None,
        }
    }

    /// Add a description to this observable.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = Some(description.into());
        self
    }

    /// Add units to this observable.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.metadata.units = Some(units.into());
        self
    }

    /// Get the current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Get the attribute name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Get the metadata.
    pub fn metadata(&self) -> &ObservableMetadata {
        &self.metadata
    }

    /// Replace the value, announcing it before local subscribers see it.
    pub(crate) fn set(&self, value: T) {
        if let Some(announce) = &self.announcer {
            announce(&value);
        }
        self.sender.send_replace(value);
    }

    /// Subscribe to value changes.
    ///
    /// ```rust,ignore
    /// let mut rx = observable.subscribe();
    /// while rx.changed().await.is_ok() {
    ///     let value = rx.borrow().clone();
    /// }
    /// ```
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + Serialize + 'static,
{
    /// Announce every change of this value on `broadcaster` as
    /// `<source>/<name>`. The current value is announced immediately.
    pub fn with_broadcaster(
        mut self,
        source: impl Into<String>,
        broadcaster: Arc<dyn ChangeBroadcaster>,
    ) -> Self {
        let source = source.into();
        let attribute = self.metadata.name.clone();
        let announcer: Announcer<T> = Arc::new(move |value: &T| {
            match serde_json::to_value(value) {
                Ok(json) => broadcaster.announce(AttributeEvent::new(&source, &attribute, json)),
                Err(e) => warn!(%source, %attribute, error = %e, "Failed to serialize attribute"),
            }
        });
        announcer(&*self.sender.borrow());
        self.announcer = Some(announcer);
        self
    }

    /// Get the current value as JSON
    pub fn get_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&*self.sender.borrow()).map_err(|e| {
            anyhow!(
                "Failed to serialize attribute '{}': {}",
                self.metadata.name,
                e
            )
        })
    }
}

impl<T> ParameterBase for Observable<T>
where
    T: Clone + Send + Sync + Serialize + 'static,
{
    fn name(&self) -> &str {
        &self.metadata.name
    }

    fn get_json(&self) -> Result<serde_json::Value> {
        Observable::get_json(self)
    }

    fn metadata(&self) -> &ObservableMetadata {
        &self.metadata
    }
}

// =============================================================================
// ParameterSet - Collection of Observables
// =============================================================================

/// A named collection of observables, stored as trait objects for generic access.
#[derive(Default)]
pub struct ParameterSet {
    parameters: HashMap<String, Box<dyn ParameterBase>>,
}

impl std::fmt::Debug for ParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterSet")
            .field("names", &self.names())
            .finish()
    }
}

impl ParameterSet {
    /// Create a new empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register any parameter-like object.
    pub fn register<P>(&mut self, parameter: P)
    where
        P: ParameterBase + 'static,
    {
        let name = parameter.name().to_string();
        self.parameters.insert(name, Box::new(parameter));
    }

    /// Get a parameter by name as a trait object.
    pub fn get(&self, name: &str) -> Option<&dyn ParameterBase> {
        self.parameters.get(name).map(|p| p.as_ref())
    }

    /// List all parameter names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.parameters.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}
