//! The handler capability and per-host route controllers.

use std::{collections::HashMap, sync::Arc};

use http::{Method, StatusCode};

use crate::{
    error::{Error, HandlerFailure, RouteError},
    query::QueryItems,
    request::{PathIdentities, Request, TypedValue},
    response::Response,
    router::{RoutePattern, TransformRegistry},
};

/// Processes one request into a response, or a tagged failure the writer
/// converts to a status.
pub trait Handler: Send + Sync {
    fn handle(&self, request: &mut Request<'_>) -> Result<Response, HandlerFailure>;
}

impl<F> Handler for F
where
    F: Fn(&mut Request<'_>) -> Result<Response, HandlerFailure> + Send + Sync,
{
    fn handle(&self, request: &mut Request<'_>) -> Result<Response, HandlerFailure> {
        self(request)
    }
}

struct Route {
    pattern: RoutePattern,
    handler: Arc<dyn Handler>,
}

pub(crate) enum Lookup {
    Found {
        handler: Arc<dyn Handler>,
        identities: PathIdentities,
    },
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

type ErrorHook = Arc<dyn Fn(&Error) -> Response + Send + Sync>;

/// Routes for one (virtual) host: method → compiled patterns, plus the
/// fallback hooks used when no handler can answer.
pub struct RouteController {
    transforms: TransformRegistry,
    routes: HashMap<Method, Vec<Route>>,
    not_found: Arc<dyn Handler>,
    internal_error: ErrorHook,
}

impl Default for RouteController {
    fn default() -> Self {
        RouteController::new()
    }
}

impl RouteController {
    pub fn new() -> RouteController {
        RouteController {
            transforms: TransformRegistry::new(),
            routes: HashMap::new(),
            not_found: Arc::new(|request: &mut Request<'_>| {
                Ok(Response::text(
                    StatusCode::NOT_FOUND,
                    format!("No route matches {}\n", request.path()),
                ))
            }),
            internal_error: Arc::new(|_err: &Error| {
                Response::text(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error\n")
            }),
        }
    }

    /// Registers a named transform for later `<name>` references in
    /// patterns. Register transforms before the routes that use them.
    pub fn transform(
        mut self,
        name: impl Into<String>,
        transform: impl Fn(&str) -> Option<TypedValue> + Send + Sync + 'static,
    ) -> RouteController {
        self.transforms.register(name, transform);
        self
    }

    pub fn route(
        mut self,
        method: Method,
        pattern: &str,
        handler: impl Handler + 'static,
    ) -> Result<RouteController, RouteError> {
        let pattern = RoutePattern::compile(pattern, &self.transforms)?;
        self.routes.entry(method).or_default().push(Route {
            pattern,
            handler: Arc::new(handler),
        });
        Ok(self)
    }

    pub fn get(self, pattern: &str, handler: impl Handler + 'static) -> Result<Self, RouteError> {
        self.route(Method::GET, pattern, handler)
    }

    pub fn post(self, pattern: &str, handler: impl Handler + 'static) -> Result<Self, RouteError> {
        self.route(Method::POST, pattern, handler)
    }

    pub fn put(self, pattern: &str, handler: impl Handler + 'static) -> Result<Self, RouteError> {
        self.route(Method::PUT, pattern, handler)
    }

    pub fn patch(self, pattern: &str, handler: impl Handler + 'static) -> Result<Self, RouteError> {
        self.route(Method::PATCH, pattern, handler)
    }

    pub fn delete(self, pattern: &str, handler: impl Handler + 'static) -> Result<Self, RouteError> {
        self.route(Method::DELETE, pattern, handler)
    }

    /// Replaces the built-in 404 handler.
    pub fn not_found(mut self, handler: impl Handler + 'static) -> RouteController {
        self.not_found = Arc::new(handler);
        self
    }

    /// Replaces the built-in internal-error response hook.
    pub fn internal_error(
        mut self,
        hook: impl Fn(&Error) -> Response + Send + Sync + 'static,
    ) -> RouteController {
        self.internal_error = Arc::new(hook);
        self
    }

    pub(crate) fn not_found_handler(&self) -> Arc<dyn Handler> {
        self.not_found.clone()
    }

    pub(crate) fn internal_error_response(&self, err: &Error) -> Response {
        (self.internal_error)(err)
    }

    /// GET routes answer HEAD requests unless HEAD routes are registered.
    fn routes_for(&self, method: &Method) -> Option<&Vec<Route>> {
        match self.routes.get(method) {
            Some(routes) => Some(routes),
            None if *method == Method::HEAD => self.routes.get(&Method::GET),
            None => None,
        }
    }

    /// The most specific matching route; specificity ties go to the
    /// earlier registration.
    pub(crate) fn lookup(&self, method: &Method, path: &str, query: &QueryItems) -> Lookup {
        if let Some(routes) = self.routes_for(method) {
            let mut best: Option<(&Route, PathIdentities, Vec<u8>)> = None;
            for route in routes {
                if let Some(identities) = route.pattern.matches(path, query) {
                    let specificity = route.pattern.specificity();
                    let better = match &best {
                        Some((_, _, current)) => specificity > *current,
                        None => true,
                    };
                    if better {
                        best = Some((route, identities, specificity));
                    }
                }
            }
            if let Some((route, identities, _)) = best {
                return Lookup::Found {
                    handler: route.handler.clone(),
                    identities,
                };
            }
        }

        let allowed: Vec<Method> = self
            .routes
            .iter()
            .filter(|(candidate, _)| *candidate != method)
            .filter(|(_, routes)| {
                routes
                    .iter()
                    .any(|route| route.pattern.matches(path, query).is_some())
            })
            .map(|(candidate, _)| candidate.clone())
            .collect();

        if allowed.is_empty() {
            Lookup::NotFound
        } else {
            Lookup::MethodNotAllowed(allowed)
        }
    }
}

/// Host header → controller, with a default for missing or unknown hosts.
pub(crate) struct VirtualHosts {
    default: Arc<RouteController>,
    hosts: HashMap<String, Arc<RouteController>>,
}

impl VirtualHosts {
    pub(crate) fn new(default: RouteController) -> VirtualHosts {
        VirtualHosts {
            default: Arc::new(default),
            hosts: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, host: impl Into<String>, controller: RouteController) {
        self.hosts
            .insert(host.into().to_ascii_lowercase(), Arc::new(controller));
    }

    pub(crate) fn select(&self, host: Option<&str>) -> Arc<RouteController> {
        host.and_then(|host| self.hosts.get(&host.to_ascii_lowercase()))
            .unwrap_or(&self.default)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(body: &'static str) -> impl Handler {
        move |_req: &mut Request<'_>| Ok(Response::text(StatusCode::OK, body))
    }

    fn lookup<'c>(controller: &'c RouteController, method: Method, path: &str) -> Lookup {
        controller.lookup(&method, path, &QueryItems::new())
    }

    #[test]
    fn more_specific_routes_win() {
        let controller = RouteController::new()
            .get("/users/:id", ok("ident"))
            .unwrap()
            .get("/users/all", ok("literal"))
            .unwrap()
            .get("/users/*", ok("star"))
            .unwrap();

        let found = match lookup(&controller, Method::GET, "/users/all") {
            Lookup::Found { handler, .. } => handler,
            _ => panic!("expected a match"),
        };
        let mut query = QueryItems::new();
        let response = handler_response(&*found, &mut query);
        assert_eq!(body_text(&response), "literal");

        let found = match lookup(&controller, Method::GET, "/users/42") {
            Lookup::Found { handler, identities } => {
                assert_eq!(identities.raw("id"), Some("42"));
                handler
            }
            _ => panic!("expected a match"),
        };
        let response = handler_response(&*found, &mut query);
        assert_eq!(body_text(&response), "ident");
    }

    #[test]
    fn specificity_ties_prefer_the_earlier_registration() {
        let controller = RouteController::new()
            .get("/x/:a", ok("first"))
            .unwrap()
            .get("/x/:b", ok("second"))
            .unwrap();

        let found = match lookup(&controller, Method::GET, "/x/1") {
            Lookup::Found { handler, .. } => handler,
            _ => panic!("expected a match"),
        };
        let mut query = QueryItems::new();
        assert_eq!(body_text(&handler_response(&*found, &mut query)), "first");
    }

    #[test]
    fn wrong_methods_surface_the_allowed_set() {
        let controller = RouteController::new()
            .get("/thing", ok("get"))
            .unwrap()
            .put("/thing", ok("put"))
            .unwrap();

        match lookup(&controller, Method::POST, "/thing") {
            Lookup::MethodNotAllowed(allowed) => {
                assert_eq!(allowed.len(), 2);
                assert!(allowed.contains(&Method::GET));
                assert!(allowed.contains(&Method::PUT));
            }
            _ => panic!("expected method-not-allowed"),
        }

        assert!(matches!(
            lookup(&controller, Method::POST, "/other"),
            Lookup::NotFound
        ));
    }

    #[test]
    fn head_falls_back_to_get_routes() {
        let controller = RouteController::new().get("/doc", ok("get")).unwrap();
        assert!(matches!(
            lookup(&controller, Method::HEAD, "/doc"),
            Lookup::Found { .. }
        ));
    }

    #[test]
    fn unknown_hosts_fall_back_to_the_default_controller() {
        let default = RouteController::new().get("/", ok("default")).unwrap();
        let mut hosts = VirtualHosts::new(default);
        hosts.insert(
            "api.example.com",
            RouteController::new().get("/", ok("api")).unwrap(),
        );

        let mut query = QueryItems::new();
        for (host, expected) in [
            (Some("api.example.com"), "api"),
            (Some("API.example.COM"), "api"),
            (Some("other.example.com"), "default"),
            (None, "default"),
        ] {
            let controller = hosts.select(host);
            let handler = match controller.lookup(&Method::GET, "/", &QueryItems::new()) {
                Lookup::Found { handler, .. } => handler,
                _ => panic!("expected a match"),
            };
            assert_eq!(body_text(&handler_response(&*handler, &mut query)), expected);
        }
    }

    // Invoking a handler in tests requires a request; fabricate a minimal
    // one over an empty body.
    fn handler_response(handler: &dyn Handler, _query: &mut QueryItems) -> Response {
        let mut request = crate::test_support::minimal_request();
        handler.handle(&mut request).unwrap()
    }

    fn body_text(response: &Response) -> String {
        match response.body() {
            crate::response::ResponseBody::Bytes { data, .. } => {
                String::from_utf8_lossy(data).into_owned()
            }
            _ => panic!("expected a bytes body"),
        }
    }
}
