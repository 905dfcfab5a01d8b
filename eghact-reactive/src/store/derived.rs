//! Derived stores.
//!
//! A derived store is a named, read-only computed over other reactive
//! values. Inputs of any kind are read through [`Readable`], so signals,
//! stores, computeds, other derived stores and plain constants mix freely.
//! Derived stores are never part of a snapshot; after hydration they simply
//! recompute from their restored inputs.

use std::fmt::Debug;
use std::sync::Arc;

use super::registry::Registry;
use super::store::{Store, StoreValue};
use crate::error::Result;
use crate::reactive::{Computed, Signal, Subscription};

/// Anything a derived store can read from.
///
/// Reads are tracked: inside a computed they register a dependency.
pub trait Readable<T>: Send + Sync {
    fn read(&self) -> Result<T>;
}

impl<T> Readable<T> for Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn read(&self) -> Result<T> {
        Ok(self.get())
    }
}

impl<T: StoreValue> Readable<T> for Store<T> {
    fn read(&self) -> Result<T> {
        Ok(self.get())
    }
}

impl<T> Readable<T> for Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn read(&self) -> Result<T> {
        self.get()
    }
}

impl<T> Readable<T> for DerivedStore<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn read(&self) -> Result<T> {
        self.get()
    }
}

/// A plain value used as an input.
#[derive(Debug, Clone, PartialEq)]
pub struct Constant<T>(pub T);

impl<T: Clone + Send + Sync> Readable<T> for Constant<T> {
    fn read(&self) -> Result<T> {
        Ok(self.0.clone())
    }
}

/// A named, read-only value computed from other reactive values.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use eghact_reactive::store::{Constant, DerivedStore, Readable, Registry, Store, StoreOptions};
///
/// let registry = Registry::new();
/// let price = Store::new(&registry, "price", 10u32, StoreOptions::new()).unwrap();
/// let qty = Store::new(&registry, "qty", 2u32, StoreOptions::new()).unwrap();
///
/// let inputs: Vec<Arc<dyn Readable<u32>>> =
///     vec![Arc::new(price.clone()), Arc::new(qty.clone()), Arc::new(Constant(1))];
/// let total = DerivedStore::new(&registry, "total", inputs, |v: &[u32]| v[0] * v[1] + v[2]);
///
/// assert_eq!(total.get().unwrap(), 21);
/// qty.set(3).unwrap();
/// assert_eq!(total.get().unwrap(), 31);
/// ```
pub struct DerivedStore<T> {
    name: Arc<str>,
    computed: Computed<T>,
}

impl<T> DerivedStore<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Derive from a list of same-typed inputs. `f` receives their current
    /// values in order.
    pub fn new<I, F>(
        registry: &Registry,
        name: impl Into<String>,
        inputs: Vec<Arc<dyn Readable<I>>>,
        f: F,
    ) -> Self
    where
        I: 'static,
        F: Fn(&[I]) -> T + Send + Sync + 'static,
    {
        Self::try_from_fn(registry, name, move || {
            let values = inputs
                .iter()
                .map(|input| input.read())
                .collect::<Result<Vec<I>>>()?;
            Ok(f(&values))
        })
    }

    /// Derive from whatever `f` reads.
    pub fn from_fn<F>(registry: &Registry, name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::try_from_fn(registry, name, move || Ok(f()))
    }

    pub fn try_from_fn<F>(registry: &Registry, name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            computed: Computed::try_new(registry.runtime(), f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value, recomputed if an input changed.
    pub fn get(&self) -> Result<T> {
        self.computed.get()
    }

    pub fn get_untracked(&self) -> Result<T> {
        self.computed.get_untracked()
    }

    pub fn version(&self) -> Result<u64> {
        self.computed.version()
    }

    /// Register a callback invoked once per pass in which the value changed.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.computed.subscribe(callback)
    }

    pub fn dispose(&self) {
        self.computed.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.computed.is_disposed()
    }

    /// The computed backing this store.
    pub fn computed(&self) -> &Computed<T> {
        &self.computed
    }
}

impl<T> Clone for DerivedStore<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            computed: self.computed.clone(),
        }
    }
}

impl<T> Debug for DerivedStore<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedStore")
            .field("name", &self.name)
            .field("computed", &self.computed)
            .finish()
    }
}
