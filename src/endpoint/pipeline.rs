//! The endpoint execution pipeline.
//!
//! One inbound request runs through a fixed sequence of phases: context
//! bind, input acquisition, input validation, service resolution, RLS
//! derivation, session derivation, authorization, handler execution (inside
//! the audit transaction, inside the RLS wrap), output validation, event
//! publication, and response formatting. Phases execute strictly in order;
//! a failure anywhere short-circuits the rest and falls through the single
//! error boundary in [`execute`], which logs the full error chain and maps
//! it to a typed response. No other phase swallows errors.

use anyhow::{Context, anyhow};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use warp::http::{Method, StatusCode};

use crate::context::{RequestContext, with_request_context};
use crate::db::{self, Database, DbHandle};
use crate::registry::{ErasedServiceDescriptor, ResolvedServices, ServiceRegistry};
use crate::tools::id_generator;
use crate::tools::watch::Watch;
use crate::web::error::ApiError;

use super::accessors::LazyLookup;
use super::audit::{self, AuditContext};
use super::events;
use super::response::{EndpointResponse, ResponseMeta};
use super::rls::{self, RlsContext};
use super::schema::Schema;
use super::{AuthorizeArgs, EndpointDefinition, HandlerArgs, RlsArgs, SessionArgs, SessionValue};

/// Transport-agnostic input to the pipeline.
///
/// Transports produce this from their native event shape; see
/// [`crate::transport`].
pub struct PipelineRequest {
    pub method: Method,
    pub path: String,
    pub host: Option<String>,
    pub header: LazyLookup,
    pub cookie: LazyLookup,
    /// Raw request body, if the transport carried one.
    pub body: Option<Value>,
    /// Raw query parameters as a JSON object.
    pub query: Value,
    /// Pre-extracted route parameters; when `None`, they are derived from
    /// the endpoint's route template and the request path.
    pub params: Option<Value>,
}

impl PipelineRequest {
    /// A minimal request for the given method and path; transports and
    /// tests fill in the rest.
    pub fn new(method: Method, path: impl ToString) -> Self {
        PipelineRequest {
            method,
            path: path.to_string(),
            host: None,
            header: LazyLookup::empty(),
            cookie: LazyLookup::empty(),
            body: None,
            query: Value::Object(Map::new()),
            params: None,
        }
    }
}

/// Executes one request against an endpoint definition.
///
/// This is the single error boundary: every failure from the inner phases
/// is logged here with its full chain and translated into a typed error
/// response: the status carried by the error when it has one, 500
/// otherwise. Stack traces and chains are logged, never returned.
pub async fn execute(
    definition: &EndpointDefinition,
    registry: &ServiceRegistry,
    request: PipelineRequest,
) -> EndpointResponse {
    // Phase 1: bind the request context and derive the per-request span.
    let request_id = id_generator::generate_request_id();
    let span = tracing::info_span!(
        "request",
        method = %request.method,
        route = definition.route.raw(),
        host = request.host.as_deref().unwrap_or("-"),
        request_id = %request_id,
    );
    let context = RequestContext::new(span.clone(), &request_id);
    let watch = Watch::start();

    let outcome = with_request_context(context, run_phases(definition, registry, request))
        .instrument(span.clone())
        .await;

    span.in_scope(|| match outcome {
        Ok((status, output, meta)) => {
            tracing::info!(
                status = status.as_u16(),
                elapsed_ms = watch.elapsed_ms(),
                "Request completed"
            );
            EndpointResponse::success(status, &output, meta)
        }
        Err(err) => {
            let api_error = err.downcast_ref::<ApiError>().cloned().unwrap_or_else(|| {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            });

            if api_error.status.is_server_error() {
                tracing::error!(
                    status = api_error.status.as_u16(),
                    elapsed_ms = watch.elapsed_ms(),
                    "Request failed: {:#}",
                    err
                );
            } else {
                tracing::warn!(
                    status = api_error.status.as_u16(),
                    elapsed_ms = watch.elapsed_ms(),
                    "Request rejected: {:#}",
                    err
                );
            }

            EndpointResponse::from_error(&api_error)
        }
    })
}

/// [`execute`] raced against a deadline.
///
/// A timeout falls through the same error funnel as any other failure; open
/// transactions are released by drop (see [`crate::db::Database`]).
pub async fn execute_with_timeout(
    definition: &EndpointDefinition,
    registry: &ServiceRegistry,
    request: PipelineRequest,
    deadline: Duration,
) -> EndpointResponse {
    match tokio::time::timeout(deadline, execute(definition, registry, request)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::error!("Request aborted after exceeding the {:?} deadline", deadline);
            EndpointResponse::from_error(&ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "Request timed out",
            ))
        }
    }
}

/// Phases 2-10; any error short-circuits to the boundary in [`execute`].
async fn run_phases(
    definition: &EndpointDefinition,
    registry: &ServiceRegistry,
    mut request: PipelineRequest,
) -> anyhow::Result<(StatusCode, Value, ResponseMeta)> {
    // Phase 2: input acquisition.
    let params_raw = match request.params.take() {
        Some(params) => params,
        None => definition
            .route
            .matches(&request.path)
            .map(params_to_value)
            .unwrap_or_else(|| Value::Object(Map::new())),
    };
    let body_raw = request.body.take().unwrap_or(Value::Null);

    // Phase 3: input validation.
    let body = validate_input(definition.body_schema.as_deref(), &body_raw, "request body")?;
    let query = validate_input(definition.query_schema.as_deref(), &request.query, "query parameters")?;
    let params = validate_input(definition.params_schema.as_deref(), &params_raw, "route parameters")?;

    // Phase 4: service resolution.
    let services = resolve_services(definition, registry).await?;
    let db = match &definition.database {
        Some(descriptor) => Some(DbHandle::pooled(db::resolve_database(&services, descriptor)?)),
        None => None,
    };

    // Phase 5: RLS derivation (only when a database handle exists).
    let rls_context = derive_rls(definition, &services, &request, db.is_some()).await?;

    // Phase 6: session derivation.
    let session = derive_session(definition, &services, &request, db.clone()).await?;

    // Phase 7: authorization.
    authorize(definition, &services, &request, session.clone(), db.clone()).await?;

    // Phase 8: handler execution.
    let meta = ResponseMeta::default();
    let output = run_handler(
        definition,
        &services,
        db,
        session,
        &request,
        body,
        query,
        params,
        meta.clone(),
        rls_context,
    )
    .await?;

    // Phase 9: output validation.
    let output = validate_output(definition.output_schema.as_deref(), output)?;

    // Phase 10: event publication, only for success responses.
    let status = meta.status_override().unwrap_or(definition.default_status);
    if status.is_success() {
        publish_events(definition, &services, &output).await?;
    }

    Ok((status, output, meta))
}

fn params_to_value(params: HashMap<String, String>) -> Value {
    Value::Object(params.into_iter().map(|(key, value)| (key, Value::String(value))).collect())
}

fn validate_input(schema: Option<&dyn Schema>, raw: &Value, what: &str) -> anyhow::Result<Value> {
    let Some(schema) = schema else {
        return Ok(raw.clone());
    };

    schema.validate(raw).map_err(|issues| {
        let details = serde_json::to_value(&issues).unwrap_or(Value::Null);
        ApiError::unprocessable(format!("Invalid {what}"), details).into_anyhow()
    })
}

fn validate_output(schema: Option<&dyn Schema>, output: Value) -> anyhow::Result<Value> {
    let Some(schema) = schema else {
        return Ok(output);
    };

    // An output mismatch is a defect in the endpoint, not the caller;
    // report it as an internal error and keep the issues out of the
    // response.
    schema.validate(&output).map_err(|issues| {
        tracing::error!(issues = ?issues, "Handler output failed the declared output schema");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Response validation failed").into_anyhow()
    })
}

#[tracing::instrument(level = "debug", skip_all)]
async fn resolve_services(
    definition: &EndpointDefinition,
    registry: &ServiceRegistry,
) -> anyhow::Result<ResolvedServices> {
    let mut descriptors: Vec<ErasedServiceDescriptor> = definition.services.clone();
    if let Some(database) = &definition.database {
        descriptors.push(database.erased());
    }
    if let Some(storage) = &definition.audit_storage {
        descriptors.push(storage.erased());
    }
    if let Some(publisher) = &definition.event_publisher {
        descriptors.push(publisher.erased());
    }

    registry.resolve(&descriptors).await
}

async fn derive_rls(
    definition: &EndpointDefinition,
    services: &ResolvedServices,
    request: &PipelineRequest,
    has_db: bool,
) -> anyhow::Result<Option<RlsContext>> {
    let Some(config) = &definition.rls else {
        return Ok(None);
    };
    if !has_db {
        return Ok(None);
    }

    (config.extractor)(RlsArgs {
        header: request.header.clone(),
        cookie: request.cookie.clone(),
        services: services.clone(),
    })
    .await
    .context("Failed to derive the row-level-security context")
}

async fn derive_session(
    definition: &EndpointDefinition,
    services: &ResolvedServices,
    request: &PipelineRequest,
    db: Option<DbHandle>,
) -> anyhow::Result<Option<SessionValue>> {
    let Some(extractor) = &definition.session else {
        return Ok(None);
    };

    extractor(SessionArgs {
        header: request.header.clone(),
        cookie: request.cookie.clone(),
        services: services.clone(),
        db,
    })
    .await
}

async fn authorize(
    definition: &EndpointDefinition,
    services: &ResolvedServices,
    request: &PipelineRequest,
    session: Option<SessionValue>,
    db: Option<DbHandle>,
) -> anyhow::Result<()> {
    // Authorization is implicitly granted when no authorizer is declared.
    let Some(authorizer) = &definition.authorizer else {
        return Ok(());
    };

    let granted = authorizer(AuthorizeArgs {
        header: request.header.clone(),
        cookie: request.cookie.clone(),
        services: services.clone(),
        session,
        db,
    })
    .await?;

    if granted {
        Ok(())
    } else {
        Err(ApiError::unauthorized().into_anyhow())
    }
}

#[tracing::instrument(level = "debug", skip_all)]
#[allow(clippy::too_many_arguments)]
async fn run_handler(
    definition: &EndpointDefinition,
    services: &ResolvedServices,
    db: Option<DbHandle>,
    session: Option<SessionValue>,
    request: &PipelineRequest,
    body: Value,
    query: Value,
    params: Value,
    meta: ResponseMeta,
    rls_context: Option<RlsContext>,
) -> anyhow::Result<Value> {
    match (&definition.rls, rls_context, db.clone()) {
        (Some(config), Some(rls_context), Some(base)) => {
            rls::with_rls_context(&base, &rls_context, config.prefix, |scoped| {
                run_audited(definition, services, Some(scoped), session, request, body, query, params, meta)
            })
            .await
        }
        _ => run_audited(definition, services, db, session, request, body, query, params, meta).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_audited(
    definition: &EndpointDefinition,
    services: &ResolvedServices,
    db: Option<DbHandle>,
    session: Option<SessionValue>,
    request: &PipelineRequest,
    body: Value,
    query: Value,
    params: Value,
    meta: ResponseMeta,
) -> anyhow::Result<Value> {
    let audit_context = build_audit_context(definition, services, db.as_ref())?;
    let handler = definition.handler.clone();
    let header = request.header.clone();
    let cookie = request.cookie.clone();
    let services = services.clone();

    audit::execute_with_audit_transaction(
        audit_context,
        db,
        move |auditor, handler_db| {
            handler(HandlerArgs {
                header,
                cookie,
                services,
                session,
                auditor,
                db: handler_db,
                body,
                query,
                params,
                meta,
            })
        },
        |output| audit::evaluate_audit_mappings(&definition.audit_mappings, output),
    )
    .await
}

/// Decides transaction sharing for the audit coordinator.
///
/// Sharing is keyed by the registry service *name*: when the audit
/// storage's backing service is the endpoint's database service, both write
/// through one transaction. A backing service the endpoint resolved under
/// another descriptor is used independently; a backing service that was
/// never declared degrades to non-transactional audit writes.
fn build_audit_context(
    definition: &EndpointDefinition,
    services: &ResolvedServices,
    db: Option<&DbHandle>,
) -> anyhow::Result<Option<AuditContext>> {
    let Some(descriptor) = &definition.audit_storage else {
        return Ok(None);
    };
    let storage = audit::resolve_audit_storage(services, descriptor)?;

    let backing_name = storage.database_service_name();
    let endpoint_db_name = definition.database.as_ref().map(|database| database.name());
    let shares_endpoint_db = backing_name.is_some() && backing_name == endpoint_db_name && db.is_some();

    let backing_db = if shares_endpoint_db {
        None
    } else if let Some(name) = backing_name {
        match services.raw(name) {
            Some(instance) => {
                let database = instance
                    .downcast::<Arc<dyn Database>>()
                    .map_err(|_| anyhow!("Audit storage backing service '{}' is not a database", name))?;
                Some(DbHandle::pooled(database.as_ref().clone()))
            }
            None => {
                tracing::warn!(
                    "Audit storage names backing service '{}' which this endpoint did not declare; \
                     audit writes run non-transactionally",
                    name
                );
                None
            }
        }
    } else {
        None
    };

    Ok(Some(AuditContext {
        storage,
        backing_db,
        shares_endpoint_db,
    }))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn publish_events(
    definition: &EndpointDefinition,
    services: &ResolvedServices,
    output: &Value,
) -> anyhow::Result<()> {
    let Some(descriptor) = &definition.event_publisher else {
        return Ok(());
    };
    if definition.event_mappings.is_empty() {
        return Ok(());
    }

    let publisher = events::resolve_event_publisher(services, descriptor)?;
    let messages = events::evaluate_event_mappings(&definition.event_mappings, output);
    publisher.publish(&messages).await.context("Failed to publish events")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testkit::RecordingDatabase;
    use crate::db::DatabaseDescriptor;
    use crate::endpoint::Endpoints;
    use crate::endpoint::audit::{
        AuditMapping, AuditOptions, AuditStorage, AuditStorageDescriptor, SqlAuditStorage,
    };
    use crate::endpoint::events::{
        EventMapping, EventMessage, EventPublisher, EventPublisherDescriptor,
    };
    use crate::endpoint::schema::{FieldKind, ObjectSchema};
    use crate::env::Env;
    use async_trait::async_trait;
    use chrono::DateTime;
    use serde_json::json;
    use std::sync::Mutex;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(Env::from_iter::<&str, &str>([]))
    }

    fn get(path: &str) -> PipelineRequest {
        PipelineRequest::new(Method::GET, path)
    }

    fn post(path: &str, body: Value) -> PipelineRequest {
        PipelineRequest {
            body: Some(body),
            ..PipelineRequest::new(Method::POST, path)
        }
    }

    fn db_service(db: Arc<RecordingDatabase>) -> DatabaseDescriptor {
        DatabaseDescriptor::new("db", move |_env| {
            let db = db.clone();
            async move { Ok(Arc::new(db) as Arc<dyn Database>) }
        })
    }

    fn audit_service() -> AuditStorageDescriptor {
        AuditStorageDescriptor::new("audit", |_env| async {
            Ok(Arc::new(SqlAuditStorage::new("audit_log").backed_by("db")) as Arc<dyn AuditStorage>)
        })
    }

    #[derive(Default)]
    struct CollectingPublisher {
        messages: Mutex<Vec<EventMessage>>,
    }

    impl CollectingPublisher {
        fn published(&self) -> Vec<EventMessage> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventPublisher for CollectingPublisher {
        async fn publish(&self, messages: &[EventMessage]) -> anyhow::Result<()> {
            self.messages.lock().unwrap().extend_from_slice(messages);
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn publisher_service(publisher: Arc<CollectingPublisher>) -> EventPublisherDescriptor {
        EventPublisherDescriptor::new("events", move |_env| {
            let publisher = publisher.clone();
            async move { Ok(publisher as Arc<dyn EventPublisher>) }
        })
    }

    fn user_body_schema() -> ObjectSchema {
        ObjectSchema::new()
            .required("name", FieldKind::String)
            .required("email", FieldKind::String)
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok_with_a_timestamp() {
        let endpoint = Endpoints::new().get("/health").handle(|_args| async move {
            Ok(json!({"status": "ok", "timestamp": chrono::Utc::now().to_rfc3339()}))
        });

        let response = execute(&endpoint, &registry(), get("/health")).await;

        assert_eq!(response.status, StatusCode::OK);
        let body = response.body_json().unwrap();
        assert_eq!(body["status"], "ok");
        assert!(DateTime::parse_from_rfc3339(body["timestamp"].as_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn a_missing_required_field_yields_422_with_one_issue() {
        let endpoint = Endpoints::new()
            .post("/users")
            .body(user_body_schema())
            .handle(|_args| async move { panic!("handler must not run on invalid input") });

        let response = execute(&endpoint, &registry(), post("/users", json!({"name": "x"}))).await;

        assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
        let body = response.body_json().unwrap();
        let details = body["details"].as_array().unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0]["path"][0], "email");
    }

    #[tokio::test]
    async fn the_authorizer_gates_the_handler() {
        let endpoint = Endpoints::new()
            .get("/admin")
            .authorize(|args| async move {
                Ok(args.header.get("authorization").as_deref() == Some("Bearer admin-token"))
            })
            .handle(|_args| async move { Ok(json!({"granted": true})) });

        let denied = execute(&endpoint, &registry(), get("/admin")).await;
        assert_eq!(denied.status, StatusCode::UNAUTHORIZED);

        let mut request = get("/admin");
        request.header = LazyLookup::from_map(
            [("authorization".to_string(), "Bearer admin-token".to_string())].into(),
        );
        let granted = execute(&endpoint, &registry(), request).await;
        assert_eq!(granted.status, StatusCode::OK);
        assert_eq!(granted.body_json().unwrap()["granted"], true);
    }

    fn audited_create_user(db: Arc<RecordingDatabase>) -> Arc<EndpointDefinition> {
        Endpoints::new()
            .post("/users")
            .database(db_service(db))
            .auditor(audit_service())
            .audit(AuditMapping::new("user.created", |out| json!({"userId": out["id"]})))
            .status(StatusCode::CREATED)
            .handle(|args| async move {
                let db = args.db.clone().unwrap();
                db.execute("insert into users", &[]).await?;
                Ok(json!({"id": "u1"}))
            })
    }

    fn audit_inserts(lines: &[String]) -> Vec<&String> {
        lines.iter().filter(|line| line.contains("insert into audit_log")).collect()
    }

    #[tokio::test]
    async fn a_successful_run_produces_exactly_one_declarative_audit_record() {
        let db = RecordingDatabase::shared();
        let endpoint = audited_create_user(db.clone());

        let response = execute(&endpoint, &registry(), post("/users", json!({}))).await;

        assert_eq!(response.status, StatusCode::CREATED);
        let committed = db.committed_lines();
        assert!(committed.iter().any(|line| line == "insert into users"));
        let audits = audit_inserts(&committed);
        assert_eq!(audits.len(), 1);
        assert!(audits[0].contains("user.created"));
        assert!(audits[0].contains("userId"));
    }

    #[tokio::test]
    async fn a_failing_handler_produces_zero_audit_records() {
        let db = RecordingDatabase::shared();
        let endpoint = Endpoints::new()
            .post("/users")
            .database(db_service(db.clone()))
            .auditor(audit_service())
            .audit(AuditMapping::new("user.created", |out| json!({"userId": out["id"]})))
            .handle(|args| async move {
                let handle = args.db.clone().unwrap();
                handle.execute("insert into users", &[]).await?;
                args.auditor
                    .clone()
                    .unwrap()
                    .audit("user.attempted", json!({}), AuditOptions::default())
                    .await?;
                anyhow::bail!("constraint violation")
            });

        let response = execute(&endpoint, &registry(), post("/users", json!({}))).await;

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        // Handler write, manual audit, and declarative audits all rolled back.
        assert!(db.committed_lines().is_empty());
        assert_eq!(db.log_lines().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn a_when_predicate_returning_false_suppresses_the_record() {
        let db = RecordingDatabase::shared();
        let endpoint = Endpoints::new()
            .post("/users")
            .database(db_service(db.clone()))
            .auditor(audit_service())
            .audit(
                AuditMapping::new("user.created", |out| out.clone())
                    .when(|out| out["created"] == json!(true)),
            )
            .handle(|_args| async move { Ok(json!({"created": false})) });

        let response = execute(&endpoint, &registry(), post("/users", json!({}))).await;

        assert_eq!(response.status, StatusCode::OK);
        assert!(audit_inserts(&db.committed_lines()).is_empty());
    }

    #[tokio::test]
    async fn events_are_published_if_and_only_if_the_status_is_2xx() {
        let publisher = Arc::new(CollectingPublisher::default());

        let succeeding = Endpoints::new()
            .post("/users")
            .publisher(publisher_service(publisher.clone()))
            .event(EventMapping::new("user.created", |out| json!({"userId": out["id"]})))
            .handle(|_args| async move { Ok(json!({"id": "u1"})) });

        execute(&succeeding, &registry(), post("/users", json!({}))).await;
        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type, "user.created");
        assert_eq!(published[0].payload, json!({"userId": "u1"}));

        // A validation failure never publishes.
        let validating = Endpoints::new()
            .post("/users")
            .body(user_body_schema())
            .publisher(publisher_service(publisher.clone()))
            .event(EventMapping::new("user.created", |out| out.clone()))
            .handle(|_args| async move { Ok(json!({})) });
        execute(&validating, &registry(), post("/users", json!({}))).await;
        assert_eq!(publisher.published().len(), 1);

        // An authorization failure never publishes.
        let denied = Endpoints::new()
            .post("/users")
            .authorize(|_args| async move { Ok(false) })
            .publisher(publisher_service(publisher.clone()))
            .event(EventMapping::new("user.created", |out| out.clone()))
            .handle(|_args| async move { Ok(json!({})) });
        execute(&denied, &registry(), post("/users", json!({}))).await;
        assert_eq!(publisher.published().len(), 1);

        // A failing handler never publishes.
        let failing = Endpoints::new()
            .post("/users")
            .publisher(publisher_service(publisher.clone()))
            .event(EventMapping::new("user.created", |out| out.clone()))
            .handle(|_args| async move { anyhow::bail!("boom") });
        execute(&failing, &registry(), post("/users", json!({}))).await;
        assert_eq!(publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn an_output_contract_violation_is_an_internal_error() {
        let endpoint = Endpoints::new()
            .get("/users/:id")
            .output(ObjectSchema::new().required("id", FieldKind::String))
            .handle(|_args| async move { Ok(json!({"wrong": true})) });

        let response = execute(&endpoint, &registry(), get("/users/u1")).await;

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.body_json().unwrap();
        assert_eq!(body["message"], "Response validation failed");
        // Issue details are a server-side concern and stay out of the body.
        assert!(body.get("details").is_none());
    }

    #[tokio::test]
    async fn handler_errors_keep_their_status_when_they_carry_one() {
        let endpoint = Endpoints::new().get("/teapot").handle(|_args| async move {
            Err(ApiError::new(StatusCode::IM_A_TEAPOT, "short and stout").into_anyhow())
        });

        let response = execute(&endpoint, &registry(), get("/teapot")).await;
        assert_eq!(response.status, StatusCode::IM_A_TEAPOT);
        assert_eq!(response.body_json().unwrap()["message"], "short and stout");
    }

    #[tokio::test]
    async fn handler_errors_without_a_status_become_an_opaque_500() {
        let endpoint = Endpoints::new().get("/boom").handle(|_args| async move {
            Err(anyhow!("secret database password is hunter2"))
        });

        let response = execute(&endpoint, &registry(), get("/boom")).await;
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.body_json().unwrap();
        assert_eq!(body["message"], "Internal server error");
        assert!(!response.body.unwrap().contains("hunter2"));
    }

    #[tokio::test]
    async fn the_handler_can_override_status_headers_and_cookies() {
        let endpoint = Endpoints::new().post("/jobs").handle(|args| async move {
            args.meta.set_status(StatusCode::ACCEPTED);
            args.meta.set_header("location", "/jobs/j1");
            Ok(json!({"id": "j1"}))
        });

        let response = execute(&endpoint, &registry(), post("/jobs", json!({}))).await;
        assert_eq!(response.status, StatusCode::ACCEPTED);
        assert_eq!(response.headers["location"], "/jobs/j1");
    }

    #[tokio::test]
    async fn the_session_is_derived_and_visible_to_the_handler() {
        let endpoint = Endpoints::new()
            .get("/whoami")
            .session(|args| async move { Ok(args.header.get("x-user")) })
            .handle(|args| async move {
                let user = args.session_as::<String>().map(|user| user.as_ref().clone());
                Ok(json!({"user": user}))
            });

        let mut request = get("/whoami");
        request.header = LazyLookup::from_map([("x-user".to_string(), "alice".to_string())].into());
        let response = execute(&endpoint, &registry(), request).await;

        assert_eq!(response.body_json().unwrap()["user"], "alice");
    }

    #[tokio::test]
    async fn the_request_context_is_bound_for_the_whole_handler_call_graph() {
        let endpoint = Endpoints::new().get("/ctx").handle(|_args| async move {
            async fn deep() -> anyhow::Result<String> {
                tokio::task::yield_now().await;
                Ok(crate::context::request_id()?)
            }
            Ok(json!({"request_id": deep().await?}))
        });

        let response = execute(&endpoint, &registry(), get("/ctx")).await;
        let request_id = response.body_json().unwrap()["request_id"].as_str().unwrap().to_string();
        assert_eq!(request_id.len(), crate::tools::id_generator::REQUEST_ID_LENGTH);
    }

    #[tokio::test]
    async fn rls_scoping_wraps_every_handler_statement() {
        let db = RecordingDatabase::shared();
        let endpoint = Endpoints::new()
            .get("/orders")
            .database(db_service(db.clone()))
            .rls("app", |_args| async move {
                Ok(Some(RlsContext::new().with("tenant_id", "t1")))
            })
            .handle(|args| async move {
                args.db.clone().unwrap().query("select * from orders", &[]).await?;
                Ok(json!([]))
            });

        let response = execute(&endpoint, &registry(), get("/orders")).await;
        assert_eq!(response.status, StatusCode::OK);

        let log = db.log_lines();
        assert_eq!(log[0], "BEGIN");
        assert!(log[1].starts_with("select set_config('app.tenant_id'"));
        assert_eq!(log[2], "select * from orders");
        assert_eq!(log[3], "COMMIT");
    }

    #[tokio::test]
    async fn rls_and_a_shared_audit_storage_use_one_transaction() {
        let db = RecordingDatabase::shared();
        let endpoint = Endpoints::new()
            .post("/orders")
            .database(db_service(db.clone()))
            .rls("app", |_args| async move {
                Ok(Some(RlsContext::new().with("tenant_id", "t1")))
            })
            .auditor(audit_service())
            .audit(AuditMapping::new("order.placed", |out| out.clone()))
            .handle(|args| async move {
                args.db.clone().unwrap().execute("insert into orders", &[]).await?;
                Ok(json!({"id": "o1"}))
            });

        let response = execute(&endpoint, &registry(), post("/orders", json!({}))).await;
        assert_eq!(response.status, StatusCode::OK);

        let log = db.log_lines();
        // One transaction wraps scope settings, handler write, and audit.
        assert_eq!(log.iter().filter(|line| *line == "BEGIN").count(), 1);
        assert_eq!(log.iter().filter(|line| *line == "COMMIT").count(), 1);
        assert_eq!(log.first().map(String::as_str), Some("BEGIN"));
        assert_eq!(log.last().map(String::as_str), Some("COMMIT"));
        assert_eq!(audit_inserts(&db.committed_lines()).len(), 1);
    }

    #[tokio::test]
    async fn an_rls_extractor_returning_none_bypasses_scoping() {
        let db = RecordingDatabase::shared();
        let endpoint = Endpoints::new()
            .get("/public")
            .database(db_service(db.clone()))
            .rls("app", |_args| async move { Ok(None) })
            .handle(|args| async move {
                args.db.clone().unwrap().query("select 1", &[]).await?;
                Ok(json!({}))
            });

        execute(&endpoint, &registry(), get("/public")).await;
        assert_eq!(db.log_lines(), vec!["select 1"]);
    }

    #[tokio::test]
    async fn a_rejecting_service_factory_is_an_internal_error_and_retried() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_factory = calls.clone();

        let flaky = crate::registry::ServiceDescriptor::new("flaky", move |_env| {
            let calls = calls_in_factory.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("connection refused");
                }
                Ok(42u32)
            }
        });

        let endpoint = Endpoints::new()
            .get("/svc")
            .service(flaky.erased())
            .handle(|_args| async move { Ok(json!({})) });
        let registry = registry();

        let first = execute(&endpoint, &registry, get("/svc")).await;
        assert_eq!(first.status, StatusCode::INTERNAL_SERVER_ERROR);

        // The failure was not cached; the next request constructs anew.
        let second = execute(&endpoint, &registry, get("/svc")).await;
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn a_timed_out_request_maps_to_504() {
        let endpoint = Endpoints::new().get("/slow").handle(|_args| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!({}))
        });

        let response = execute_with_timeout(
            &endpoint,
            &registry(),
            get("/slow"),
            Duration::from_millis(20),
        )
        .await;
        assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
    }
}
