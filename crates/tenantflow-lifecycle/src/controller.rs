//! Resource lifecycle controller
//!
//! Composes the [`Poller`] and [`Reconciler`] into create / read / update /
//! delete workflows for one resource type. Every call is a single sequential
//! unit of work: request, poll to terminal, optional follow-up read. Nothing
//! is kept between calls; the host owns the identifier and the last observed
//! state.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::desired::DesiredState;
use crate::error::{LifecycleError, Result};
use crate::executor::{Method, Request, RequestExecutor, Response};
use crate::operation::{Operation, OperationStatus};
use crate::poller::Poller;
use crate::reconcile::{FieldPath, Patch, Reconciler};
use crate::retry::RetryPolicy;

/// Default time to wait for one long-running operation
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(20 * 60);

const DEFAULT_ID_POINTER: &str = "/id";
const FALLBACK_ID_POINTER: &str = "/name";
const PROVISIONING_STATE_POINTER: &str = "/properties/provisioningState";

/// Lifecycle phase of one resource instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Absent,
    Creating,
    Active,
    Updating,
    Deleting,
    Deleted,
    /// Terminal for the current call; the host retries the whole operation
    Failed,
}

impl LifecyclePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecyclePhase::Deleted | LifecyclePhase::Failed)
    }

    pub fn can_transition_to(&self, next: LifecyclePhase) -> bool {
        use LifecyclePhase::*;
        match (self, next) {
            (Deleted | Failed, _) => false,
            (_, Failed) => true,
            (Absent, Creating)
            | (Creating, Active)
            | (Active, Updating)
            | (Updating, Active)
            | (Active, Deleting)
            | (Deleting, Deleted)
            | (Active, Absent) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecyclePhase::Absent => write!(f, "absent"),
            LifecyclePhase::Creating => write!(f, "creating"),
            LifecyclePhase::Active => write!(f, "active"),
            LifecyclePhase::Updating => write!(f, "updating"),
            LifecyclePhase::Deleting => write!(f, "deleting"),
            LifecyclePhase::Deleted => write!(f, "deleted"),
            LifecyclePhase::Failed => write!(f, "failed"),
        }
    }
}

/// Per-call record of the resource being driven
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_type: String,
    pub id: Option<String>,
    pub phase: LifecyclePhase,
}

impl ResourceRecord {
    pub fn new(resource_type: impl Into<String>, id: Option<String>, phase: LifecyclePhase) -> Self {
        Self {
            resource_type: resource_type.into(),
            id,
            phase,
        }
    }

    pub fn transition(&mut self, next: LifecyclePhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        info!(
            resource_type = %self.resource_type,
            id = self.id.as_deref().unwrap_or("-"),
            "{} -> {}",
            self.phase,
            next
        );
        self.phase = next;
        Ok(())
    }

    /// Move to `Failed` and hand the error back.
    fn fail(&mut self, error: LifecycleError) -> LifecycleError {
        warn!(
            resource_type = %self.resource_type,
            id = self.id.as_deref().unwrap_or("-"),
            kind = error.kind(),
            "Lifecycle call failed in phase {}: {}",
            self.phase,
            error
        );
        if self.phase.can_transition_to(LifecyclePhase::Failed) {
            self.phase = LifecyclePhase::Failed;
        }
        error
    }
}

/// Whether a multi-field patch is sent in one request or one request per entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    #[default]
    Atomic,
    PerEntry,
}

/// Sequence whose elements are matched by an identity field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityKey {
    pub path: Vec<String>,
    pub key: String,
}

fn default_true() -> bool {
    true
}

fn default_update_method() -> Method {
    Method::Patch
}

fn default_create_method() -> Method {
    Method::Post
}

fn default_id_pointer() -> String {
    DEFAULT_ID_POINTER.to_string()
}

/// How one resource type maps onto the remote API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub resource_type: String,

    /// Collection endpoint, target of create requests
    pub collection_url: String,

    /// Item endpoint with an `{id}` placeholder. Defaults to
    /// `<collection_url>/{id}` (query string kept at the end).
    #[serde(default)]
    pub item_url: Option<String>,

    #[serde(default = "default_create_method")]
    pub create_method: Method,

    #[serde(default = "default_update_method")]
    pub update_method: Method,

    /// JSON pointer to the identifier in create results
    #[serde(default = "default_id_pointer")]
    pub id_pointer: String,

    #[serde(default)]
    pub update_mode: UpdateMode,

    #[serde(default)]
    pub identities: Vec<IdentityKey>,

    /// Re-read after an update and return that instead of the projection
    #[serde(default = "default_true")]
    pub confirm_with_read: bool,
}

impl ResourceDescriptor {
    pub fn new(resource_type: impl Into<String>, collection_url: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            collection_url: collection_url.into(),
            item_url: None,
            create_method: default_create_method(),
            update_method: default_update_method(),
            id_pointer: default_id_pointer(),
            update_mode: UpdateMode::default(),
            identities: Vec::new(),
            confirm_with_read: true,
        }
    }

    pub fn with_item_url(mut self, template: impl Into<String>) -> Self {
        self.item_url = Some(template.into());
        self
    }

    pub fn with_update_method(mut self, method: Method) -> Self {
        self.update_method = method;
        self
    }

    pub fn with_update_mode(mut self, mode: UpdateMode) -> Self {
        self.update_mode = mode;
        self
    }

    pub fn with_id_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.id_pointer = pointer.into();
        self
    }

    pub fn with_identity<I, S>(mut self, path: I, key: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identities.push(IdentityKey {
            path: path.into_iter().map(Into::into).collect(),
            key: key.into(),
        });
        self
    }

    pub fn with_confirm_with_read(mut self, confirm: bool) -> Self {
        self.confirm_with_read = confirm;
        self
    }

    pub fn item_url(&self, id: &str) -> String {
        match &self.item_url {
            Some(template) => template.replace("{id}", id),
            None => match self.collection_url.split_once('?') {
                Some((base, query)) => format!("{}/{}?{}", base.trim_end_matches('/'), id, query),
                None => format!("{}/{}", self.collection_url.trim_end_matches('/'), id),
            },
        }
    }

    /// Identifier in a create result: `id_pointer`, then `/name`. Resource
    /// paths (`/environments/env-1`) yield their last segment.
    pub fn extract_id(&self, value: &Value) -> Option<String> {
        [self.id_pointer.as_str(), FALLBACK_ID_POINTER]
            .iter()
            .find_map(|pointer| value.pointer(pointer).and_then(id_string))
    }

    pub fn reconciler(&self) -> Reconciler {
        self.identities
            .iter()
            .fold(Reconciler::new(), |reconciler, identity| {
                reconciler.with_identity(identity.path.iter().cloned(), identity.key.clone())
            })
    }
}

fn id_string(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.trim_end_matches('/').rsplit('/').next()?.to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!raw.is_empty()).then_some(raw)
}

/// Result of a successful create
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Created {
    pub id: String,
    pub observed: Value,
}

pub struct ResourceController {
    descriptor: ResourceDescriptor,
    reconciler: Reconciler,
    executor: Arc<dyn RequestExecutor>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    poller: Poller,
    timeout: Duration,
    cancel: CancellationToken,
}

impl ResourceController {
    pub fn new(
        descriptor: ResourceDescriptor,
        executor: Arc<dyn RequestExecutor>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let poller = Poller::new(Arc::clone(&executor), policy.clone(), Arc::clone(&clock));
        Self {
            reconciler: descriptor.reconciler(),
            descriptor,
            executor,
            policy,
            clock,
            poller,
            timeout: DEFAULT_OPERATION_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    /// Overall deadline for each long-running operation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Cancellation signal observed by every request and polling wait.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub async fn create(&self, desired: &DesiredState) -> Result<Created> {
        let mut record =
            ResourceRecord::new(&self.descriptor.resource_type, None, LifecyclePhase::Absent);
        record.transition(LifecyclePhase::Creating)?;

        match self.create_inner(desired, &mut record).await {
            Ok(created) => {
                record.transition(LifecyclePhase::Active)?;
                Ok(created)
            }
            Err(e) => Err(record.fail(e)),
        }
    }

    async fn create_inner(
        &self,
        desired: &DesiredState,
        record: &mut ResourceRecord,
    ) -> Result<Created> {
        let request = Request::new(self.descriptor.create_method, &self.descriptor.collection_url)
            .with_body(desired.to_value());
        let response = self.send(request).await?;

        let (observed, id) = if response.is_pending() {
            let fallback_id = response.body.as_ref().and_then(|b| self.descriptor.extract_id(b));
            let operation = self.await_operation(&response, &self.descriptor.resource_type).await?;
            let id = operation
                .result
                .as_ref()
                .and_then(|r| self.descriptor.extract_id(r))
                .or_else(|| {
                    operation
                        .last_body
                        .as_ref()
                        .and_then(|b| self.descriptor.extract_id(b))
                })
                .or(fallback_id);
            (operation.result.filter(Value::is_object), id)
        } else {
            let body = response.body.unwrap_or(Value::Null);
            check_provisioning_state(&body)?;
            let id = self.descriptor.extract_id(&body);
            (Some(body).filter(Value::is_object), id)
        };

        let id = id.ok_or_else(|| {
            LifecycleError::MissingIdentifier(format!(
                "no identifier at {} in create result for {}",
                self.descriptor.id_pointer, self.descriptor.resource_type
            ))
        })?;
        record.id = Some(id.clone());

        // no resource payload came back: read the created item
        let observed = match observed {
            Some(observed) => observed,
            None => self.fetch(&id).await?,
        };

        Ok(Created { id, observed })
    }

    /// Current observed state, `None` when the resource no longer exists.
    pub async fn read(&self, id: &str) -> Result<Option<Value>> {
        let mut record = ResourceRecord::new(
            &self.descriptor.resource_type,
            Some(id.to_string()),
            LifecyclePhase::Active,
        );
        match self.fetch(id).await {
            Ok(observed) => Ok(Some(observed)),
            Err(e) if e.is_not_found() => {
                record.transition(LifecyclePhase::Absent)?;
                Ok(None)
            }
            Err(e) => Err(record.fail(e)),
        }
    }

    /// Move the resource toward `desired`, touching only the fields it names.
    ///
    /// A 404 on the initial read is surfaced as [`LifecycleError::NotFound`]:
    /// the resource was deleted outside this provider.
    pub async fn update(
        &self,
        id: &str,
        desired: &DesiredState,
        last_observed: Option<&Value>,
    ) -> Result<Value> {
        let mut record = ResourceRecord::new(
            &self.descriptor.resource_type,
            Some(id.to_string()),
            LifecyclePhase::Active,
        );
        record.transition(LifecyclePhase::Updating)?;

        match self.update_inner(id, desired, last_observed).await {
            Ok(observed) => {
                record.transition(LifecyclePhase::Active)?;
                Ok(observed)
            }
            Err(e) => {
                if e.is_not_found() {
                    warn!(
                        resource_type = %self.descriptor.resource_type,
                        id,
                        "Resource was deleted outside of tenantflow"
                    );
                }
                Err(record.fail(e))
            }
        }
    }

    async fn update_inner(
        &self,
        id: &str,
        desired: &DesiredState,
        last_observed: Option<&Value>,
    ) -> Result<Value> {
        let observed = self.fetch(id).await?;

        if let Some(last) = last_observed {
            if last != &observed {
                warn!(
                    resource_type = %self.descriptor.resource_type,
                    id,
                    "Drift detected: remote state changed since it was last observed"
                );
            }
        }

        let patch = self.reconciler.diff(desired, &observed);
        if patch.is_empty() {
            debug!(resource_type = %self.descriptor.resource_type, id, "No changes to apply");
            return Ok(observed);
        }
        info!(
            resource_type = %self.descriptor.resource_type,
            id,
            "Applying {} change(s): {}",
            patch.len(),
            patch.paths().iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        );

        let projected = match self.descriptor.update_mode {
            UpdateMode::Atomic => {
                self.apply(id, &patch, &observed).await?;
                self.reconciler.project(&observed, &patch)
            }
            UpdateMode::PerEntry => self.apply_per_entry(id, &patch, &observed).await?,
        };

        if !self.descriptor.confirm_with_read {
            return Ok(projected);
        }

        let confirmed = self.fetch(id).await?;
        let unsettled = self.reconciler.diff(desired, &confirmed);
        if !unsettled.is_empty() {
            warn!(
                resource_type = %self.descriptor.resource_type,
                id,
                "Remote state after update differs from the requested values at: {}",
                unsettled.paths().iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
            );
        }
        Ok(confirmed)
    }

    async fn apply(&self, id: &str, patch: &Patch, observed: &Value) -> Result<()> {
        let request = Request::new(self.descriptor.update_method, self.descriptor.item_url(id))
            .with_body(patch.to_body(observed));
        let response = self.send(request).await?;
        if response.is_pending() {
            self.await_operation(&response, &self.target(id)).await?;
        }
        Ok(())
    }

    /// Send each entry on its own; returns the projected state.
    async fn apply_per_entry(&self, id: &str, patch: &Patch, observed: &Value) -> Result<Value> {
        let mut current = observed.clone();
        let mut applied: Vec<FieldPath> = Vec::new();

        for entry in patch.entries() {
            let single = Patch::single(entry.clone());
            if let Err(e) = self.apply(id, &single, &current).await {
                if applied.is_empty() {
                    return Err(e);
                }
                return Err(LifecycleError::PartialUpdate {
                    applied,
                    source: Box::new(e),
                });
            }
            current = single.project(&current);
            applied.push(entry.path.clone());
        }

        Ok(current)
    }

    /// Delete the resource. Already gone counts as success.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut record = ResourceRecord::new(
            &self.descriptor.resource_type,
            Some(id.to_string()),
            LifecyclePhase::Active,
        );
        record.transition(LifecyclePhase::Deleting)?;

        let outcome = async {
            let response = self.send(Request::delete(self.descriptor.item_url(id))).await?;
            if response.is_pending() {
                self.await_operation(&response, &self.target(id)).await?;
            }
            Ok::<_, LifecycleError>(())
        }
        .await;

        match outcome {
            Ok(()) => record.transition(LifecyclePhase::Deleted),
            Err(e) if e.is_not_found() => {
                debug!(resource_type = %self.descriptor.resource_type, id, "Already deleted");
                record.transition(LifecyclePhase::Deleted)
            }
            Err(e) => Err(record.fail(e)),
        }
    }

    async fn fetch(&self, id: &str) -> Result<Value> {
        let response = self.send(Request::get(self.descriptor.item_url(id))).await?;
        response.body.ok_or_else(|| {
            LifecycleError::MalformedResponse(format!(
                "empty body reading {} {}",
                self.descriptor.resource_type, id
            ))
        })
    }

    /// One request through the retry policy; non-2xx become errors.
    async fn send(&self, request: Request) -> Result<Response> {
        let label = format!("{} {}", request.method, self.descriptor.resource_type);
        let url = request.url.clone();
        debug!(url = %url, "{}", label);

        let attempt = self.policy.run(self.clock.as_ref(), &label, || {
            let executor = Arc::clone(&self.executor);
            let request = request.clone();
            async move { executor.execute(request).await?.error_for_status() }
        });

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(LifecycleError::Canceled { locator: url }),
            response = attempt => response,
        }
    }

    /// Poll an accepted operation to completion and hand back its final state.
    async fn await_operation(&self, accepted: &Response, target: &str) -> Result<Operation> {
        let mut operation = Operation::from_accepted(target, accepted, self.clock.utc_now())
            .ok_or_else(|| {
                LifecycleError::MalformedResponse(
                    "accepted response without a poll locator".to_string(),
                )
            })?;
        info!(operation = %operation.id, target, "Operation accepted, polling {}", operation.locator);
        self.poller.wait(&mut operation, self.timeout, &self.cancel).await?;
        Ok(operation)
    }

    fn target(&self, id: &str) -> String {
        format!("{}/{}", self.descriptor.resource_type, id)
    }
}

/// A synchronous create that still reports a non-succeeded provisioning state.
fn check_provisioning_state(body: &Value) -> Result<()> {
    match body.pointer(PROVISIONING_STATE_POINTER).and_then(Value::as_str) {
        Some(state) if OperationStatus::from_remote(state) != OperationStatus::Succeeded => {
            Err(LifecycleError::OperationFailed { detail: body.clone() })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phase_transitions() {
        use LifecyclePhase::*;
        assert!(Absent.can_transition_to(Creating));
        assert!(Creating.can_transition_to(Active));
        assert!(Active.can_transition_to(Updating));
        assert!(Updating.can_transition_to(Active));
        assert!(Active.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Deleted));
        assert!(Updating.can_transition_to(Failed));

        assert!(!Absent.can_transition_to(Active));
        assert!(!Deleted.can_transition_to(Creating));
        assert!(!Failed.can_transition_to(Active));
        assert!(!Creating.can_transition_to(Deleting));
    }

    #[test]
    fn test_record_rejects_invalid_transition() {
        let mut record = ResourceRecord::new("environment", None, LifecyclePhase::Absent);
        let err = record.transition(LifecyclePhase::Deleted).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
        assert_eq!(record.phase, LifecyclePhase::Absent);
    }

    #[test]
    fn test_item_url() {
        let d = ResourceDescriptor::new("environment", "https://api.example.com/environments?api-version=2023-06-01");
        assert_eq!(
            d.item_url("env-1"),
            "https://api.example.com/environments/env-1?api-version=2023-06-01"
        );

        let d = ResourceDescriptor::new("settings", "https://api.example.com/settings")
            .with_item_url("https://api.example.com/environments/{id}/settings");
        assert_eq!(d.item_url("env-1"), "https://api.example.com/environments/env-1/settings");
    }

    #[test]
    fn test_extract_id() {
        let d = ResourceDescriptor::new("environment", "https://api.example.com/environments");
        assert_eq!(d.extract_id(&json!({"id": "env-1"})), Some("env-1".into()));
        assert_eq!(d.extract_id(&json!({"name": "grp-2"})), Some("grp-2".into()));
        assert_eq!(d.extract_id(&json!({"id": 42})), Some("42".into()));
        assert_eq!(d.extract_id(&json!({"other": 1})), None);

        let d = d.with_id_pointer("/links/environment/path");
        assert_eq!(
            d.extract_id(&json!({"links": {"environment": {"path": "/environments/env-9"}}})),
            Some("env-9".into())
        );
    }

    #[test]
    fn test_descriptor_defaults_from_json() {
        let d: ResourceDescriptor = serde_json::from_value(json!({
            "resource_type": "environment",
            "collection_url": "https://api.example.com/environments",
        }))
        .unwrap();
        assert_eq!(d.update_method, Method::Patch);
        assert_eq!(d.create_method, Method::Post);
        assert_eq!(d.id_pointer, "/id");
        assert_eq!(d.update_mode, UpdateMode::Atomic);
        assert!(d.confirm_with_read);
    }

    #[test]
    fn test_sync_create_provisioning_state() {
        assert!(check_provisioning_state(&json!({"id": "x"})).is_ok());
        assert!(check_provisioning_state(&json!({"properties": {"provisioningState": "Succeeded"}})).is_ok());
        assert!(matches!(
            check_provisioning_state(&json!({"properties": {"provisioningState": "Failed"}})),
            Err(LifecycleError::OperationFailed { .. })
        ));
    }
}
