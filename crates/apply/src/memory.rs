//! In-memory cluster used by tests and local dry runs.
//!
//! Behaves like the API server where it matters for apply: creating an
//! existing object is a 409, updating a missing one is a 404, and an update
//! whose version token does not match the stored one is a 409 conflict.
//! Every call is recorded together with the token it carried.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kapply_core::{Cluster, Object, ObjectApi, RemoteError};
use kube::error::ErrorResponse;
use kube::ResourceExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Create,
    Update,
}

/// One recorded remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    /// Version token sent with the call (create/update only).
    pub resource_version: Option<String>,
}

type Key = (String, Option<String>, String);

#[derive(Debug, Clone, Copy)]
enum Fault {
    Status(u16),
    Timeout(Duration),
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<Key, serde_json::Value>,
    next_rv: u64,
    calls: Vec<Call>,
    faults: Vec<(Verb, String, Fault)>,
}

impl State {
    fn next_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn fault(&self, verb: Verb, name: &str) -> Option<RemoteError> {
        self.faults
            .iter()
            .find(|(v, n, _)| *v == verb && n == name)
            .map(|(_, _, fault)| match *fault {
                Fault::Status(code) => api_error(code, "InternalError", &format!("injected failure for {}", name)),
                Fault::Timeout(d) => RemoteError::Timeout(d),
            })
    }
}

fn api_error(code: u16, reason: &str, message: &str) -> RemoteError {
    RemoteError::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<State>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `obj` as if it already existed. Keeps its version token when set,
    /// otherwise assigns one. Returns the stored token. Not recorded as a call.
    pub fn seed<K: Object>(&self, mut obj: K) -> Result<String, RemoteError> {
        let mut st = self.lock();
        let rv = match obj.resource_version() {
            Some(rv) => rv,
            None => st.next_rv(),
        };
        obj.meta_mut().resource_version = Some(rv.clone());
        let key = (K::kind(&()).into_owned(), obj.namespace(), obj.name_any());
        st.objects.insert(key, serde_json::to_value(&obj)?);
        Ok(rv)
    }

    /// Current stored copy of an object.
    pub fn object<K: Object>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let st = self.lock();
        let key = (K::kind(&()).into_owned(), namespace.map(str::to_string), name.to_string());
        st.objects.get(&key).and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Make every `verb` call on objects named `name` fail with HTTP `code`.
    pub fn fail(&self, verb: Verb, name: &str, code: u16) {
        self.lock().faults.push((verb, name.to_string(), Fault::Status(code)));
    }

    /// Make every `verb` call on objects named `name` report a timeout after `after`.
    pub fn stall(&self, verb: Verb, name: &str, after: Duration) {
        self.lock().faults.push((verb, name.to_string(), Fault::Timeout(after)));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cluster for MemoryCluster {
    fn api<K: Object>(&self, namespace: Option<&str>) -> Box<dyn ObjectApi<K>> {
        Box::new(MemoryApi::<K> {
            state: self.state.clone(),
            namespace: namespace.map(str::to_string),
            _kind: PhantomData,
        })
    }
}

struct MemoryApi<K> {
    state: Arc<Mutex<State>>,
    namespace: Option<String>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Object> MemoryApi<K> {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(&self, name: &str) -> Key {
        (K::kind(&()).into_owned(), self.namespace.clone(), name.to_string())
    }

    fn record(&self, st: &mut State, verb: Verb, name: &str, resource_version: Option<String>) {
        st.calls.push(Call {
            verb,
            kind: K::kind(&()).into_owned(),
            namespace: self.namespace.clone(),
            name: name.to_string(),
            resource_version,
        });
    }

    fn store(&self, st: &mut State, obj: &K) -> Result<K, RemoteError> {
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(st.next_rv());
        stored.meta_mut().namespace = self.namespace.clone();
        st.objects.insert(self.key(&obj.name_any()), serde_json::to_value(&stored)?);
        Ok(stored)
    }
}

#[async_trait::async_trait]
impl<K: Object> ObjectApi<K> for MemoryApi<K> {
    async fn get(&self, name: &str) -> Result<Option<K>, RemoteError> {
        let mut st = self.lock();
        self.record(&mut st, Verb::Get, name, None);
        if let Some(e) = st.fault(Verb::Get, name) {
            return Err(e);
        }
        match st.objects.get(&self.key(name)) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    async fn create(&self, obj: &K) -> Result<K, RemoteError> {
        let name = obj.name_any();
        let mut st = self.lock();
        self.record(&mut st, Verb::Create, &name, obj.resource_version());
        if let Some(e) = st.fault(Verb::Create, &name) {
            return Err(e);
        }
        if obj.resource_version().is_some() {
            return Err(api_error(400, "BadRequest", "resourceVersion should not be set on objects to be created"));
        }
        if st.objects.contains_key(&self.key(&name)) {
            return Err(api_error(409, "AlreadyExists", &format!("{} already exists", name)));
        }
        self.store(&mut st, obj)
    }

    async fn update(&self, obj: &K) -> Result<K, RemoteError> {
        let name = obj.name_any();
        let mut st = self.lock();
        self.record(&mut st, Verb::Update, &name, obj.resource_version());
        if let Some(e) = st.fault(Verb::Update, &name) {
            return Err(e);
        }
        let current = match st.objects.get(&self.key(&name)) {
            Some(v) => v.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()).map(str::to_string),
            None => return Err(api_error(404, "NotFound", &format!("{} not found", name))),
        };
        if let Some(sent) = obj.resource_version() {
            if current.as_deref() != Some(sent.as_str()) {
                return Err(api_error(
                    409,
                    "Conflict",
                    "the object has been modified; please apply your changes to the latest version and try again",
                ));
            }
        }
        self.store(&mut st, obj)
    }
}
