//! Deterministic key derivation.
//!
//! A key is `ID_<operation>_ID_<hash>` where `<hash>` is, by default, the
//! JSON encoding of the arguments with every object's keys sorted
//! recursively. Arrays keep their order and `()`/`None` encode as `null`.
//! Two argument values that are equal after sorting always produce the
//! same key, whatever order their fields were inserted in.
//!
//! Values that have no JSON form are wrapped in [`Opaque`]. The default hash
//! refuses them with [`CacheError::NonSerializableArgument`]; an installed
//! hash function can special-case such shapes and delegate the rest:
//!
//! ```rust
//! # use huginn::KeyHasher;
//! # use std::sync::Arc;
//! # use serde_json::Value;
//! let hasher = KeyHasher::new();
//! hasher.install_hash_function(|default| {
//!     Arc::new(move |value: &Value| match value.get("key") {
//!         Some(key) => Ok(key.to_string()),
//!         None => default(value),
//!     })
//! });
//! ```

use std::any::type_name;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};

use crate::key::OperationId;
use crate::{CacheError, Result};

/// Field name marking an [`Opaque`] value in the JSON tree.
pub const OPAQUE_MARKER: &str = "$opaque";

/// A hash function over the JSON form of arguments.
pub type HashFn = Arc<dyn Fn(&Value) -> Result<String> + Send + Sync>;

/// Wraps a value that has no stable JSON form (callbacks, handles).
///
/// Serializes to `{"$opaque": "<type name>"}` so that a custom hash
/// function can still see the surrounding structure.
pub struct Opaque<T>(pub T);

impl<T> Serialize for Opaque<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(OPAQUE_MARKER, type_name::<T>())?;
        map.end()
    }
}

impl<T: Clone> Clone for Opaque<T> {
    fn clone(&self) -> Self {
        Opaque(self.0.clone())
    }
}

impl<T> fmt::Debug for Opaque<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque<{}>", type_name::<T>())
    }
}

/// Default hash: sorted-key JSON.
pub fn stable_stringify(value: &Value) -> Result<String> {
    let canonical = canonicalize(value)?;
    Ok(serde_json::to_string(&canonical)?)
}

fn canonicalize(value: &Value) -> Result<Value> {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(name)) = map.get(OPAQUE_MARKER) {
                return Err(CacheError::NonSerializableArgument(format!(
                    "cannot hash opaque value of type {name}"
                )));
            }
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key])?);
            }
            Ok(Value::Object(sorted))
        }
        Value::Array(items) => Ok(Value::Array(
            items.iter().map(canonicalize).collect::<Result<_>>()?,
        )),
        other => Ok(other.clone()),
    }
}

/// Key derivation service with an optional custom hash function.
///
/// Clones share the installed hash function.
#[derive(Clone, Default)]
pub struct KeyHasher {
    custom: Arc<RwLock<Option<HashFn>>>,
}

impl KeyHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a hash function built from the default one.
    ///
    /// `decorate` receives the default hash and returns the function used
    /// from now on. Replaces any previously installed function.
    pub fn install_hash_function<F>(&self, decorate: F)
    where
        F: FnOnce(HashFn) -> HashFn,
    {
        let default: HashFn = Arc::new(stable_stringify);
        let installed = decorate(default);
        *self.custom.write().unwrap_or_else(PoisonError::into_inner) = Some(installed);
    }

    /// Go back to the default hash.
    pub fn reset_hash_function(&self) {
        *self.custom.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn has_custom_hash(&self) -> bool {
        self.custom
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Hash an already-converted JSON value.
    pub fn hash_value(&self, value: &Value) -> Result<String> {
        let custom = self
            .custom
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match custom {
            Some(hash) => hash(value),
            None => stable_stringify(value),
        }
    }

    /// Hash arguments through their `Serialize` impl.
    pub fn hash_args<A: Serialize + ?Sized>(&self, args: &A) -> Result<String> {
        let value = serde_json::to_value(args)
            .map_err(|e| CacheError::NonSerializableArgument(e.to_string()))?;
        self.hash_value(&value)
    }

    /// Derive the cache key of `operation` called with `args`.
    pub fn compute_key<A: Serialize + ?Sized>(
        &self,
        operation: OperationId,
        args: &A,
    ) -> Result<String> {
        Ok(format!("ID_{operation}_ID_{}", self.hash_args(args)?))
    }
}

impl fmt::Debug for KeyHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHasher")
            .field("custom", &self.has_custom_hash())
            .finish()
    }
}
