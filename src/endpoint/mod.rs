//! Endpoint declarations and their execution.
//!
//! An API operation is declared once through the fluent builder and frozen
//! into an [`EndpointDefinition`] by `.handle(..)`. The definition carries
//! everything the pipeline needs: route and method, input/output schemas,
//! declared services, session derivation, authorization, audit and event
//! mappings, and row-level-security configuration. Definitions are built at
//! module-load/startup time, are immutable, and are shared by every
//! invocation.
//!
//! ```rust,ignore
//! let create_user = Endpoints::new()
//!     .post("/users")
//!     .body(ObjectSchema::new()
//!         .required("name", FieldKind::String)
//!         .required("email", FieldKind::String))
//!     .database(DB.clone())
//!     .auditor(AUDIT.clone())
//!     .audit(AuditMapping::new("user.created", |out| json!({"userId": out["id"]})))
//!     .handle(|args| async move {
//!         let user = create(&args).await?;
//!         Ok(json!(user))
//!     });
//! ```

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use warp::http::{Method, StatusCode};

pub mod accessors;
pub mod audit;
pub mod events;
pub mod pipeline;
pub mod response;
pub mod rls;
pub mod route;
pub mod schema;

use crate::db::{DatabaseDescriptor, DbHandle};
use crate::registry::{ErasedServiceDescriptor, ResolvedServices};
use accessors::LazyLookup;
use audit::{AuditMapping, AuditStorageDescriptor, Auditor};
use events::{EventMapping, EventPublisherDescriptor};
use response::ResponseMeta;
use rls::RlsContext;
use route::RouteTemplate;
use schema::Schema;

pub use pipeline::{PipelineRequest, execute, execute_with_timeout};

/// A session value derived for one request; downcast with
/// [`HandlerArgs::session_as`].
pub type SessionValue = Arc<dyn Any + Send + Sync>;

type SessionExtractorFn =
    dyn Fn(SessionArgs) -> BoxFuture<'static, anyhow::Result<Option<SessionValue>>> + Send + Sync;
type AuthorizerFn = dyn Fn(AuthorizeArgs) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync;
type RlsExtractorFn =
    dyn Fn(RlsArgs) -> BoxFuture<'static, anyhow::Result<Option<RlsContext>>> + Send + Sync;
type HandlerFn = dyn Fn(HandlerArgs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// What a session extractor gets to look at.
pub struct SessionArgs {
    pub header: LazyLookup,
    pub cookie: LazyLookup,
    pub services: ResolvedServices,
    pub db: Option<DbHandle>,
}

/// What an authorizer gets to look at.
pub struct AuthorizeArgs {
    pub header: LazyLookup,
    pub cookie: LazyLookup,
    pub services: ResolvedServices,
    pub session: Option<SessionValue>,
    pub db: Option<DbHandle>,
}

/// What a row-level-security extractor gets to look at.
pub struct RlsArgs {
    pub header: LazyLookup,
    pub cookie: LazyLookup,
    pub services: ResolvedServices,
}

/// Everything a handler receives for one request.
pub struct HandlerArgs {
    pub header: LazyLookup,
    pub cookie: LazyLookup,
    pub services: ResolvedServices,
    pub session: Option<SessionValue>,
    pub auditor: Option<Auditor>,
    pub db: Option<DbHandle>,
    /// Validated request body (`Null` when none was declared or sent).
    pub body: Value,
    /// Validated query parameters.
    pub query: Value,
    /// Validated route parameters.
    pub params: Value,
    /// Response annotations (status override, headers, cookies).
    pub meta: ResponseMeta,
}

impl HandlerArgs {
    /// Deserializes the validated body into a typed value.
    pub fn body_as<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Deserializes the validated query parameters into a typed value.
    pub fn query_as<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.query.clone())?)
    }

    /// A single route parameter, e.g. `args.param("id")`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }

    /// Downcasts the session to the type the extractor produced.
    pub fn session_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.session.as_ref().and_then(|session| session.clone().downcast::<T>().ok())
    }
}

/// Row-level-security configuration of one endpoint.
#[derive(Clone)]
pub struct RlsConfig {
    pub(crate) extractor: Arc<RlsExtractorFn>,
    /// Setting-name prefix, e.g. `app` for `app.tenant_id`.
    pub(crate) prefix: &'static str,
}

/// Frozen descriptor of one API operation.
///
/// Produced by [`EndpointBuilder::handle`]; immutable thereafter and shared
/// by every invocation across all transports.
pub struct EndpointDefinition {
    pub(crate) route: RouteTemplate,
    pub(crate) method: Method,
    pub(crate) body_schema: Option<Arc<dyn Schema>>,
    pub(crate) query_schema: Option<Arc<dyn Schema>>,
    pub(crate) params_schema: Option<Arc<dyn Schema>>,
    pub(crate) output_schema: Option<Arc<dyn Schema>>,
    pub(crate) services: Vec<ErasedServiceDescriptor>,
    pub(crate) session: Option<Arc<SessionExtractorFn>>,
    pub(crate) authorizer: Option<Arc<AuthorizerFn>>,
    pub(crate) database: Option<DatabaseDescriptor>,
    pub(crate) audit_storage: Option<AuditStorageDescriptor>,
    pub(crate) audit_mappings: Vec<AuditMapping>,
    pub(crate) event_publisher: Option<EventPublisherDescriptor>,
    pub(crate) event_mappings: Vec<EventMapping>,
    pub(crate) rls: Option<RlsConfig>,
    pub(crate) default_status: StatusCode,
    pub(crate) handler: Arc<HandlerFn>,
}

impl EndpointDefinition {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn route(&self) -> &str {
        self.route.raw()
    }

    /// Whether this endpoint's route template matches the given path.
    pub fn route_matches(&self, path: &str) -> bool {
        self.route.matches(path).is_some()
    }
}

/// Shared configuration inherited by every chain a factory starts.
#[derive(Clone, Default)]
struct BuilderConfig {
    services: Vec<ErasedServiceDescriptor>,
    session: Option<Arc<SessionExtractorFn>>,
    authorizer: Option<Arc<AuthorizerFn>>,
    database: Option<DatabaseDescriptor>,
    audit_storage: Option<AuditStorageDescriptor>,
    audit_mappings: Vec<AuditMapping>,
    event_publisher: Option<EventPublisherDescriptor>,
    event_mappings: Vec<EventMapping>,
    rls: Option<RlsConfig>,
    default_status: Option<StatusCode>,
}

/// Factory for endpoint builder chains.
///
/// A factory may carry shared configuration (session extractor, authorizer,
/// services); every `.get/.post/...` call clones that configuration into an
/// independent chain, so one factory can seed many endpoints without
/// cross-contamination.
#[derive(Clone, Default)]
pub struct Endpoints {
    base: BuilderConfig,
}

impl Endpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preconfigures a session extractor inherited by every chain.
    pub fn with_session<S, F, Fut>(mut self, extractor: F) -> Self
    where
        S: Send + Sync + 'static,
        F: Fn(SessionArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<S>>> + Send + 'static,
    {
        self.base.session = Some(wrap_session_extractor(extractor));
        self
    }

    /// Preconfigures an authorizer inherited by every chain.
    pub fn with_authorizer<F, Fut>(mut self, authorizer: F) -> Self
    where
        F: Fn(AuthorizeArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.base.authorizer = Some(Arc::new(move |args| authorizer(args).boxed()));
        self
    }

    /// Preconfigures service dependencies inherited by every chain.
    pub fn with_services(mut self, services: impl IntoIterator<Item = ErasedServiceDescriptor>) -> Self {
        self.base.services.extend(services);
        self
    }

    /// Preconfigures the default success status inherited by every chain.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.base.default_status = Some(status);
        self
    }

    pub fn get(&self, route: impl ToString) -> EndpointBuilder {
        self.start(Method::GET, route)
    }

    pub fn post(&self, route: impl ToString) -> EndpointBuilder {
        self.start(Method::POST, route)
    }

    pub fn put(&self, route: impl ToString) -> EndpointBuilder {
        self.start(Method::PUT, route)
    }

    pub fn patch(&self, route: impl ToString) -> EndpointBuilder {
        self.start(Method::PATCH, route)
    }

    pub fn delete(&self, route: impl ToString) -> EndpointBuilder {
        self.start(Method::DELETE, route)
    }

    fn start(&self, method: Method, route: impl ToString) -> EndpointBuilder {
        EndpointBuilder {
            config: self.base.clone(),
            method,
            route: route.to_string(),
            body_schema: None,
            query_schema: None,
            params_schema: None,
            output_schema: None,
        }
    }
}

fn wrap_session_extractor<S, F, Fut>(extractor: F) -> Arc<SessionExtractorFn>
where
    S: Send + Sync + 'static,
    F: Fn(SessionArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<S>>> + Send + 'static,
{
    Arc::new(move |args| {
        let fut = extractor(args);
        async move { Ok(fut.await?.map(|session| Arc::new(session) as SessionValue)) }.boxed()
    })
}

/// One endpoint declaration in progress.
///
/// Configuration accumulates through chained calls; [`handle`](Self::handle)
/// freezes it into an [`EndpointDefinition`].
pub struct EndpointBuilder {
    config: BuilderConfig,
    method: Method,
    route: String,
    body_schema: Option<Arc<dyn Schema>>,
    query_schema: Option<Arc<dyn Schema>>,
    params_schema: Option<Arc<dyn Schema>>,
    output_schema: Option<Arc<dyn Schema>>,
}

impl EndpointBuilder {
    /// Declares the request body schema.
    pub fn body(mut self, schema: impl Schema + 'static) -> Self {
        self.body_schema = Some(Arc::new(schema));
        self
    }

    /// Declares the query-parameter schema.
    pub fn query(mut self, schema: impl Schema + 'static) -> Self {
        self.query_schema = Some(Arc::new(schema));
        self
    }

    /// Declares the route-parameter schema.
    pub fn params(mut self, schema: impl Schema + 'static) -> Self {
        self.params_schema = Some(Arc::new(schema));
        self
    }

    /// Declares the output schema; a handler result failing it is an
    /// internal error, not a client error.
    pub fn output(mut self, schema: impl Schema + 'static) -> Self {
        self.output_schema = Some(Arc::new(schema));
        self
    }

    /// Declares service dependencies resolved before the handler runs.
    pub fn services(mut self, services: impl IntoIterator<Item = ErasedServiceDescriptor>) -> Self {
        self.config.services.extend(services);
        self
    }

    /// Declares a single service dependency.
    pub fn service(mut self, service: ErasedServiceDescriptor) -> Self {
        self.config.services.push(service);
        self
    }

    /// Declares how the session is derived. Default: no session.
    pub fn session<S, F, Fut>(mut self, extractor: F) -> Self
    where
        S: Send + Sync + 'static,
        F: Fn(SessionArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<S>>> + Send + 'static,
    {
        self.config.session = Some(wrap_session_extractor(extractor));
        self
    }

    /// Declares the authorizer; returning `false` denies with 401.
    /// Default: implicitly granted.
    pub fn authorize<F, Fut>(mut self, authorizer: F) -> Self
    where
        F: Fn(AuthorizeArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.config.authorizer = Some(Arc::new(move |args| authorizer(args).boxed()));
        self
    }

    /// Declares the database service the handler works against.
    pub fn database(mut self, database: DatabaseDescriptor) -> Self {
        self.config.database = Some(database);
        self
    }

    /// Declares the audit storage used by mappings and the manual auditor.
    pub fn auditor(mut self, storage: AuditStorageDescriptor) -> Self {
        self.config.audit_storage = Some(storage);
        self
    }

    /// Adds a declarative audit mapping evaluated after a successful run.
    pub fn audit(mut self, mapping: AuditMapping) -> Self {
        self.config.audit_mappings.push(mapping);
        self
    }

    /// Declares the event publisher used by event mappings.
    pub fn publisher(mut self, publisher: EventPublisherDescriptor) -> Self {
        self.config.event_publisher = Some(publisher);
        self
    }

    /// Adds a declarative event mapping published on 2xx responses.
    pub fn event(mut self, mapping: EventMapping) -> Self {
        self.config.event_mappings.push(mapping);
        self
    }

    /// Declares row-level-security scoping for the handler's database
    /// handle. The extractor may return `None` to bypass scoping for a
    /// request.
    pub fn rls<F, Fut>(mut self, prefix: &'static str, extractor: F) -> Self
    where
        F: Fn(RlsArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<RlsContext>>> + Send + 'static,
    {
        self.config.rls = Some(RlsConfig {
            extractor: Arc::new(move |args| extractor(args).boxed()),
            prefix,
        });
        self
    }

    /// Overrides the default success status (200).
    pub fn status(mut self, status: StatusCode) -> Self {
        self.config.default_status = Some(status);
        self
    }

    /// Freezes the declaration.
    ///
    /// # Panics
    ///
    /// Panics when audit mappings were declared without an audit storage, or
    /// event mappings without a publisher. Both are definition-time
    /// programming errors that would otherwise silently drop records.
    pub fn handle<F, Fut>(self, handler: F) -> Arc<EndpointDefinition>
    where
        F: Fn(HandlerArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let config = self.config;

        if !config.audit_mappings.is_empty() && config.audit_storage.is_none() {
            panic!(
                "Endpoint {} {} declares audit mappings but no audit storage",
                self.method, self.route
            );
        }
        if !config.event_mappings.is_empty() && config.event_publisher.is_none() {
            panic!(
                "Endpoint {} {} declares event mappings but no event publisher",
                self.method, self.route
            );
        }

        Arc::new(EndpointDefinition {
            route: RouteTemplate::parse(&self.route),
            method: self.method,
            body_schema: self.body_schema,
            query_schema: self.query_schema,
            params_schema: self.params_schema,
            output_schema: self.output_schema,
            services: config.services,
            session: config.session,
            authorizer: config.authorizer,
            database: config.database,
            audit_storage: config.audit_storage,
            audit_mappings: config.audit_mappings,
            event_publisher: config.event_publisher,
            event_mappings: config.event_mappings,
            rls: config.rls,
            default_status: config.default_status.unwrap_or(StatusCode::OK),
            handler: Arc::new(move |args| handler(args).boxed()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::audit::{AuditMapping, AuditStorage, SqlAuditStorage};
    use super::events::EventMapping;
    use super::*;
    use crate::registry::ServiceDescriptor;
    use serde_json::json;

    fn counter_service(name: &'static str) -> ErasedServiceDescriptor {
        ServiceDescriptor::new(name, |_env| async { Ok(0u32) }).erased()
    }

    fn audit_storage() -> audit::AuditStorageDescriptor {
        audit::AuditStorageDescriptor::new("audit", |_env| async {
            Ok(Arc::new(SqlAuditStorage::new("audit_log")) as Arc<dyn AuditStorage>)
        })
    }

    #[test]
    fn handle_freezes_the_declaration() {
        let endpoint = Endpoints::new()
            .post("/users/:id")
            .status(StatusCode::CREATED)
            .handle(|_args| async move { Ok(json!({})) });

        assert_eq!(endpoint.method(), &Method::POST);
        assert_eq!(endpoint.route(), "/users/:id");
        assert!(endpoint.route_matches("/users/u1"));
        assert_eq!(endpoint.default_status, StatusCode::CREATED);
    }

    #[test]
    fn the_default_success_status_is_200() {
        let endpoint = Endpoints::new()
            .get("/health")
            .handle(|_args| async move { Ok(json!({})) });
        assert_eq!(endpoint.default_status, StatusCode::OK);
    }

    #[test]
    fn factory_chains_do_not_cross_contaminate() {
        let factory = Endpoints::new()
            .with_status(StatusCode::CREATED)
            .with_services([counter_service("shared")]);

        let first = factory
            .post("/a")
            .service(counter_service("only_a"))
            .handle(|_args| async move { Ok(json!({})) });
        let second = factory.post("/b").handle(|_args| async move { Ok(json!({})) });

        // Both inherit the factory's configuration...
        assert_eq!(first.default_status, StatusCode::CREATED);
        assert_eq!(second.default_status, StatusCode::CREATED);

        // ...but the chain-local service never leaks into the sibling.
        let first_names: Vec<_> = first.services.iter().map(|svc| svc.name()).collect();
        let second_names: Vec<_> = second.services.iter().map(|svc| svc.name()).collect();
        assert_eq!(first_names, vec!["shared", "only_a"]);
        assert_eq!(second_names, vec!["shared"]);
    }

    #[test]
    fn inherited_authorizer_applies_to_every_chain() {
        let factory = Endpoints::new().with_authorizer(|_args| async move { Ok(false) });
        let endpoint = factory
            .get("/locked")
            .handle(|_args| async move { Ok(json!({})) });
        assert!(endpoint.authorizer.is_some());
    }

    #[test]
    #[should_panic(expected = "audit mappings but no audit storage")]
    fn audit_mappings_without_a_storage_fail_at_definition_time() {
        let _ = Endpoints::new()
            .post("/users")
            .audit(AuditMapping::new("user.created", |out| out.clone()))
            .handle(|_args| async move { Ok(json!({})) });
    }

    #[test]
    #[should_panic(expected = "event mappings but no event publisher")]
    fn event_mappings_without_a_publisher_fail_at_definition_time() {
        let _ = Endpoints::new()
            .post("/users")
            .event(EventMapping::new("user.created", |out| out.clone()))
            .handle(|_args| async move { Ok(json!({})) });
    }

    #[test]
    fn audit_mappings_with_a_storage_build_fine() {
        let endpoint = Endpoints::new()
            .post("/users")
            .auditor(audit_storage())
            .audit(AuditMapping::new("user.created", |out| out.clone()))
            .handle(|_args| async move { Ok(json!({})) });
        assert_eq!(endpoint.audit_mappings.len(), 1);
    }
}
