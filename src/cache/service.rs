//! Namespace-bound handles held by API clients.

use super::manager::{CacheManager, NamespaceInfo, Scope};
use super::namespace::{CachePolicy, Lookup};
use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

pub const PUBCHEM: &str = "pubchem";
pub const CAS: &str = "cas";
pub const NCI: &str = "nci";
pub const PUBCHEM_VIEW: &str = "pubchemview";
pub const CLASSYFIRE: &str = "classyfire";
pub const OPSIN: &str = "opsin";
/// Namespace for calls that do not belong to a specific service.
pub const GLOBAL: &str = "global";

pub const KNOWN_NAMESPACES: [&str; 7] = [PUBCHEM, CAS, NCI, PUBCHEM_VIEW, CLASSYFIRE, OPSIN, GLOBAL];

pub fn is_known_namespace(namespace: &str) -> bool {
    KNOWN_NAMESPACES.contains(&namespace)
}

/// A client's view of the cache: one namespace and a default [`CachePolicy`].
#[derive(Clone)]
pub struct ServiceCache {
    manager: Arc<CacheManager>,
    namespace: String,
    policy: CachePolicy,
}

impl ServiceCache {
    pub fn new(manager: Arc<CacheManager>, namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        manager.namespace(&namespace)?;
        Ok(Self {
            manager,
            namespace,
            policy: CachePolicy::default(),
        })
    }

    /// Handle for one of the built-in service namespaces on the global manager.
    pub fn for_service(namespace: &str) -> Result<Self> {
        if !is_known_namespace(namespace) {
            return Err(Error::UnknownNamespace(namespace.to_string()));
        }
        Self::new(crate::global::global()?, namespace)
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_use_cache(self, use_cache: bool) -> Self {
        self.with_policy(CachePolicy::from_use_cache(use_cache))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    pub async fn get_or_compute<A, T, F, Fut, E>(&self, call_signature: &str, args: &A, compute: F) -> Result<T>
    where
        A: Serialize + ?Sized,
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>> + 'static,
    {
        self.fetch(call_signature, args, self.policy, compute)
            .await
            .map(|lookup| lookup.value)
    }

    pub async fn fetch<A, T, F, Fut, E>(
        &self,
        call_signature: &str,
        args: &A,
        policy: CachePolicy,
        compute: F,
    ) -> Result<Lookup<T>>
    where
        A: Serialize + ?Sized,
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>> + 'static,
    {
        self.manager
            .fetch(&self.namespace, call_signature, args, policy, compute)
            .await
    }

    pub fn invalidate<A: Serialize + ?Sized>(&self, call_signature: &str, args: &A) -> Result<bool> {
        self.manager.invalidate(&self.namespace, call_signature, args)
    }

    pub fn clear(&self) -> Result<usize> {
        self.manager.clear(&Scope::namespace(self.namespace.clone()))
    }

    pub fn info(&self) -> Result<NamespaceInfo> {
        self.manager.namespace_info(&self.namespace)
    }

    /// Bind `compute` to `call_signature`, producing a cached callable.
    pub fn cached_fn<A, T, F, Fut, E>(&self, call_signature: impl Into<String>, compute: F) -> CachedFn<A, T, F>
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        CachedFn {
            cache: self.clone(),
            call_signature: call_signature.into(),
            compute: Arc::new(compute),
            _marker: PhantomData,
        }
    }
}

impl std::fmt::Debug for ServiceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCache")
            .field("namespace", &self.namespace)
            .field("policy", &self.policy)
            .field("cache_dir", &self.manager.cache_dir())
            .finish()
    }
}

/// A compute function wrapped so each call goes through the cache first.
///
/// ```rust,no_run
/// # async fn demo(cache: provesid_cache::ServiceCache) -> provesid_cache::Result<()> {
/// let by_cid = cache.cached_fn("get_compound_by_cid", |cid: u64| async move {
///     Ok::<_, std::io::Error>(format!("compound {}", cid))
/// });
/// let first: String = by_cid.call(2244).await?;
/// # Ok(())
/// # }
/// ```
pub struct CachedFn<A, T, F> {
    cache: ServiceCache,
    call_signature: String,
    compute: Arc<F>,
    _marker: PhantomData<fn(A) -> T>,
}

impl<A, T, F, Fut, E> CachedFn<A, T, F>
where
    A: Serialize + Send + 'static,
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>> + 'static,
{
    pub fn call_signature(&self) -> &str {
        &self.call_signature
    }

    pub async fn call(&self, args: A) -> Result<T> {
        self.call_with(args, self.cache.policy).await.map(|l| l.value)
    }

    pub async fn call_with(&self, args: A, policy: CachePolicy) -> Result<Lookup<T>> {
        let key_args = self
            .cache
            .manager
            .key_deriver()
            .argument_value(&self.cache.namespace, &self.call_signature, &args)?;
        let compute = Arc::clone(&self.compute);
        self.cache
            .fetch(&self.call_signature, &key_args, policy, move || compute(args))
            .await
    }
}

impl<A, T, F> Clone for CachedFn<A, T, F> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            call_signature: self.call_signature.clone(),
            compute: Arc::clone(&self.compute),
            _marker: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::namespace::HitSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(dir: &std::path::Path) -> Arc<CacheManager> {
        Arc::new(CacheManager::at(dir).unwrap())
    }

    #[test]
    fn test_known_namespaces() {
        assert!(is_known_namespace("pubchemview"));
        assert!(!is_known_namespace("chembl"));
        assert!(matches!(
            ServiceCache::for_service("chembl"),
            Err(Error::UnknownNamespace(_))
        ));
    }

    #[tokio::test]
    async fn test_cached_fn_computes_once_per_argument() {
        let root = tempfile::tempdir().unwrap();
        let cache = ServiceCache::new(manager(root.path()), OPSIN).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let parse = cache.cached_fn("parse_name", move |name: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(format!("smiles:{}", name))
            }
        });

        assert_eq!(parse.call("ethanol".into()).await.unwrap(), "smiles:ethanol");
        assert_eq!(parse.call("ethanol".into()).await.unwrap(), "smiles:ethanol");
        assert_eq!(parse.call("benzene".into()).await.unwrap(), "smiles:benzene");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.info().unwrap().disk_entries, 2);
    }

    #[tokio::test]
    async fn test_cached_fn_rejects_nan_argument() {
        let root = tempfile::tempdir().unwrap();
        let cache = ServiceCache::new(manager(root.path()), PUBCHEM).unwrap();
        let by_mass = cache.cached_fn("search_by_mass", |mass: Option<f64>| async move {
            Ok::<_, std::io::Error>(mass.map(|m| m.to_string()))
        });
        assert_eq!(by_mass.call(None).await.unwrap(), None);
        let err = by_mass.call(Some(f64::NAN)).await.unwrap_err();
        assert!(matches!(err, Error::KeyDerivation { .. }));
        assert_eq!(cache.info().unwrap().disk_entries, 1);
    }

    #[tokio::test]
    async fn test_use_cache_false_recomputes_but_stores() {
        let root = tempfile::tempdir().unwrap();
        let shared = manager(root.path());
        let fresh = ServiceCache::new(shared.clone(), NCI).unwrap().with_use_cache(false);
        let cached = ServiceCache::new(shared, NCI).unwrap();

        for n in 1..=2u32 {
            let v: u32 = fresh
                .get_or_compute("resolve", &("caffeine",), move || async move { Ok::<_, std::io::Error>(n) })
                .await
                .unwrap();
            assert_eq!(v, n);
        }
        let lookup: Lookup<u32> = cached
            .fetch("resolve", &("caffeine",), CachePolicy::ReadWrite, || async {
                Ok::<_, std::io::Error>(99)
            })
            .await
            .unwrap();
        assert_eq!(lookup.value, 2);
        assert_eq!(lookup.source, HitSource::Memory);
    }
}
