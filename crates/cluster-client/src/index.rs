//! Field indices over a watched collection.
//!
//! The API server has no "pods on node X" query that is served from a local
//! cache, so the controller keeps its own: a [`FieldIndexer`] fed by
//! `kube_runtime::watcher` events, holding one or more named indices that map
//! an extracted field value to the objects carrying it.
//!
//! Indices must be registered before the first event is applied. Once the
//! informer is running the set of indices is frozen.

use crate::error::ClusterError;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::serde::de::DeserializeOwned;
use kube::{Api, Resource};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{WatchStreamExt, watcher};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Index name for pods keyed by the node they are scheduled on.
pub const POD_NODE_NAME_FIELD: &str = "spec.nodeName";

type Extractor<K> = Arc<dyn Fn(&K) -> Vec<String> + Send + Sync>;

struct Inner<K>
where
    K: Resource,
    K::DynamicType: Eq + Hash + Clone,
{
    extractors: HashMap<String, Extractor<K>>,
    objects: HashMap<ObjectRef<K>, Arc<K>>,
    indices: HashMap<String, HashMap<String, HashSet<ObjectRef<K>>>>,
    /// Objects collected between `Init` and `InitDone` of a (re)list
    relist: Option<HashMap<ObjectRef<K>, Arc<K>>>,
    started: bool,
}

impl<K> Inner<K>
where
    K: Resource,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    fn insert(&mut self, obj: Arc<K>) {
        let key = ObjectRef::from_obj(obj.as_ref());
        if let Some(previous) = self.objects.insert(key.clone(), Arc::clone(&obj)) {
            self.unindex(&key, &previous);
        }
        self.index(&key, &obj);
    }

    fn remove(&mut self, key: &ObjectRef<K>) {
        if let Some(previous) = self.objects.remove(key) {
            self.unindex(key, &previous);
        }
    }

    fn index(&mut self, key: &ObjectRef<K>, obj: &K) {
        let Inner { extractors, indices, .. } = self;
        for (field, extract) in extractors.iter() {
            let bucket = indices.entry(field.clone()).or_default();
            for value in extract(obj) {
                bucket.entry(value).or_default().insert(key.clone());
            }
        }
    }

    fn unindex(&mut self, key: &ObjectRef<K>, obj: &K) {
        let Inner { extractors, indices, .. } = self;
        for (field, extract) in extractors.iter() {
            let Some(bucket) = indices.get_mut(field) else {
                continue;
            };
            for value in extract(obj) {
                if let Some(refs) = bucket.get_mut(&value) {
                    refs.remove(key);
                    if refs.is_empty() {
                        bucket.remove(&value);
                    }
                }
            }
        }
    }

    fn rebuild(&mut self) {
        for bucket in self.indices.values_mut() {
            bucket.clear();
        }
        let objects: Vec<(ObjectRef<K>, Arc<K>)> = self
            .objects
            .iter()
            .map(|(key, obj)| (key.clone(), Arc::clone(obj)))
            .collect();
        for (key, obj) in objects {
            self.index(&key, &obj);
        }
    }
}

/// Secondary indices over a collection of `K`, fed by watch events.
///
/// Cloning is cheap and every clone shares the same state, so one clone can
/// be handed to the informer task while another serves queries.
pub struct FieldIndexer<K>
where
    K: Resource,
    K::DynamicType: Eq + Hash + Clone,
{
    inner: Arc<RwLock<Inner<K>>>,
    synced: Arc<watch::Sender<bool>>,
}

impl<K> Clone for FieldIndexer<K>
where
    K: Resource,
    K::DynamicType: Eq + Hash + Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            synced: Arc::clone(&self.synced),
        }
    }
}

impl<K> fmt::Debug for FieldIndexer<K>
where
    K: Resource,
    K::DynamicType: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("FieldIndexer")
            .field("indices", &inner.extractors.keys().collect::<Vec<_>>())
            .field("objects", &inner.objects.len())
            .field("synced", &*self.synced.borrow())
            .finish()
    }
}

impl<K> Default for FieldIndexer<K>
where
    K: Resource,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> FieldIndexer<K>
where
    K: Resource,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    /// Creates an empty indexer with no registered indices.
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                extractors: HashMap::new(),
                objects: HashMap::new(),
                indices: HashMap::new(),
                relist: None,
                started: false,
            })),
            synced: Arc::new(synced),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<K>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<K>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a named index.
    ///
    /// The extractor returns every value the object should be reachable
    /// under; an empty vector keeps the object out of this index.
    ///
    /// # Errors
    ///
    /// - `InvalidIndex` if `field` is blank
    /// - `IndexConflict` if `field` is already registered
    /// - `IndexAlreadyStarted` if events have already been applied
    pub fn register_index<F>(&self, field: &str, extractor: F) -> Result<(), ClusterError>
    where
        F: Fn(&K) -> Vec<String> + Send + Sync + 'static,
    {
        if field.trim().is_empty() {
            return Err(ClusterError::InvalidIndex(
                "index field name must not be empty".to_string(),
            ));
        }

        let mut inner = self.write();
        if inner.started {
            return Err(ClusterError::IndexAlreadyStarted(field.to_string()));
        }
        if inner.extractors.contains_key(field) {
            return Err(ClusterError::IndexConflict(field.to_string()));
        }

        inner.extractors.insert(field.to_string(), Arc::new(extractor));
        inner.indices.insert(field.to_string(), HashMap::new());
        info!("Registered {} index on {}", K::kind(&K::DynamicType::default()), field);
        Ok(())
    }

    /// Applies one watch event.
    ///
    /// A (re)list (`Init`, `InitApply`*, `InitDone`) replaces the whole
    /// contents atomically when `InitDone` arrives; the indexer reports itself
    /// synced from the first `InitDone` on.
    pub fn apply(&self, event: watcher::Event<K>) {
        let mut inner = self.write();
        inner.started = true;
        match event {
            watcher::Event::Apply(obj) => inner.insert(Arc::new(obj)),
            watcher::Event::Delete(obj) => inner.remove(&ObjectRef::from_obj(&obj)),
            watcher::Event::Init => inner.relist = Some(HashMap::new()),
            watcher::Event::InitApply(obj) => {
                let key = ObjectRef::from_obj(&obj);
                inner
                    .relist
                    .get_or_insert_with(HashMap::new)
                    .insert(key, Arc::new(obj));
            }
            watcher::Event::InitDone => {
                if let Some(objects) = inner.relist.take() {
                    inner.objects = objects;
                    inner.rebuild();
                }
                debug!(
                    "{} index relisted with {} objects",
                    K::kind(&K::DynamicType::default()),
                    inner.objects.len()
                );
                drop(inner);
                self.synced.send_replace(true);
            }
        }
    }

    /// Objects reachable under `value` in the index named `field`.
    ///
    /// # Errors
    ///
    /// - `IndexNotRegistered` if no index named `field` exists
    /// - `CacheNotSynced` before the first full list completed
    pub fn by_index(&self, field: &str, value: &str) -> Result<Vec<Arc<K>>, ClusterError> {
        let inner = self.read();
        let bucket = inner
            .indices
            .get(field)
            .ok_or_else(|| ClusterError::IndexNotRegistered(field.to_string()))?;

        if !self.is_synced() {
            return Err(ClusterError::CacheNotSynced(format!(
                "{} index has not completed its initial list",
                field
            )));
        }

        Ok(bucket
            .get(value)
            .map(|refs| {
                refs.iter()
                    .filter_map(|key| inner.objects.get(key).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// True once the first full list has been applied.
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Resolves once the first full list has been applied.
    pub async fn wait_until_synced(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives as long as `self`, so this only returns on sync
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Number of objects currently held.
    pub fn len(&self) -> usize {
        self.read().objects.len()
    }

    /// True when no objects are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Extracts the scheduled node name of a pod. Unscheduled pods yield nothing.
pub fn pod_node_name(pod: &Pod) -> Vec<String> {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .filter(|name| !name.is_empty())
        .map(|name| vec![name.to_string()])
        .unwrap_or_default()
}

/// Registers the `spec.nodeName` index on a pod indexer.
pub fn register_pod_node_index(indexer: &FieldIndexer<Pod>) -> Result<(), ClusterError> {
    indexer.register_index(POD_NODE_NAME_FIELD, pod_node_name)
}

/// Watches `api` forever and feeds every event into `indexer`.
///
/// Watch errors are logged and retried with the watcher's default backoff.
pub async fn run_informer<K>(api: Api<K>, indexer: FieldIndexer<K>)
where
    K: Resource + Clone + fmt::Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    info!("Starting {} informer", kind);

    watcher(api, watcher::Config::default())
        .default_backoff()
        .for_each(|event| {
            match event {
                Ok(event) => indexer.apply(event),
                Err(e) => error!("{} watch error: {}", kind, e),
            }
            futures::future::ready(())
        })
        .await;

    info!("{} informer stopped", kind);
}
