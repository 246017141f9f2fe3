//! The relay's route table: a declarative mapping of URL patterns to
//! (SDK kind, handler action, streaming flag).

use crate::credentials::SdkKind;
use crate::events::EventEndpoint;
use hyper::Method;
use routing::{Route, RouteSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Status,
    /// Evaluation poll; `full` selects the evalx response shape.
    Evaluate { full: bool },
    PollAllFlags,
    PollFlag,
    PollSegment,
    StreamAll,
    StreamFlags,
    StreamPing,
    Events(EventEndpoint),
    EventsImage,
    Goals,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteSpec {
    pub kind: Option<SdkKind>,
    pub action: Action,
    pub streaming: bool,
}

impl RouteSpec {
    const fn new(kind: SdkKind, action: Action) -> Self {
        Self {
            kind: Some(kind),
            action,
            streaming: false,
        }
    }

    const fn streaming(kind: SdkKind, action: Action) -> Self {
        Self {
            kind: Some(kind),
            action,
            streaming: true,
        }
    }

    /// Browser routes get CORS handling, including OPTIONS preflight.
    pub fn is_cors(&self) -> bool {
        self.kind == Some(SdkKind::Js)
    }
}

fn report() -> Method {
    Method::from_bytes(b"REPORT").expect("REPORT is a valid method")
}

pub fn relay_routes() -> RouteSet<RouteSpec> {
    use Action::*;
    use SdkKind::*;

    let get = || vec![Method::GET];
    let rep = || vec![report()];
    let post = || vec![Method::POST];

    let mut routes = vec![Route::new(
        get(),
        "/status",
        RouteSpec {
            kind: None,
            action: Status,
            streaming: false,
        },
    )];

    // Browser evaluation polls
    for (prefix, full) in [("/sdk/eval", false), ("/sdk/evalx", true)] {
        routes.push(Route::new(
            get(),
            &format!("{prefix}/{{envId}}/users/{{user}}"),
            RouteSpec::new(Js, Evaluate { full }),
        ));
        routes.push(Route::new(
            rep(),
            &format!("{prefix}/{{envId}}/user"),
            RouteSpec::new(Js, Evaluate { full }),
        ));
    }

    // Server and mobile evaluation polls
    for (base, kind) in [("/sdk", Server), ("/msdk", Mobile)] {
        for (eval, full) in [("eval", false), ("evalx", true)] {
            routes.push(Route::new(
                get(),
                &format!("{base}/{eval}/users/{{user}}"),
                RouteSpec::new(kind, Evaluate { full }),
            ));
            routes.push(Route::new(
                rep(),
                &format!("{base}/{eval}/user"),
                RouteSpec::new(kind, Evaluate { full }),
            ));
        }
    }

    // Server-side polls
    routes.push(Route::new(get(), "/sdk/flags", RouteSpec::new(Server, PollAllFlags)));
    routes.push(Route::new(get(), "/sdk/flags/{key}", RouteSpec::new(Server, PollFlag)));
    routes.push(Route::new(get(), "/sdk/segments/{key}", RouteSpec::new(Server, PollSegment)));

    // Server-side streams
    routes.push(Route::new(get(), "/all", RouteSpec::streaming(Server, StreamAll)));
    routes.push(Route::new(get(), "/flags", RouteSpec::streaming(Server, StreamFlags)));

    // Mobile streams (eval streams are ping-based; clients re-poll on ping)
    routes.push(Route::new(get(), "/mping", RouteSpec::streaming(Mobile, StreamPing)));
    routes.push(Route::new(rep(), "/meval", RouteSpec::streaming(Mobile, StreamPing)));
    routes.push(Route::new(get(), "/meval/{user}", RouteSpec::streaming(Mobile, StreamPing)));

    // Browser streams
    routes.push(Route::new(get(), "/ping/{envId}", RouteSpec::streaming(Js, StreamPing)));
    routes.push(Route::new(get(), "/eval/{envId}/{user}", RouteSpec::streaming(Js, StreamPing)));
    routes.push(Route::new(rep(), "/eval/{envId}", RouteSpec::streaming(Js, StreamPing)));

    // Server events
    routes.push(Route::new(post(), "/bulk", RouteSpec::new(Server, Events(EventEndpoint::ServerEvents))));
    routes.push(Route::new(post(), "/diagnostic", RouteSpec::new(Server, Events(EventEndpoint::ServerDiagnostic))));

    // Mobile events
    for path in ["/mobile", "/mobile/events", "/mobile/events/bulk"] {
        routes.push(Route::new(post(), path, RouteSpec::new(Mobile, Events(EventEndpoint::MobileEvents))));
    }
    routes.push(Route::new(
        post(),
        "/mobile/events/diagnostic",
        RouteSpec::new(Mobile, Events(EventEndpoint::MobileDiagnostic)),
    ));

    // Browser events (CORS applies to diagnostic as well as bulk)
    routes.push(Route::new(
        post(),
        "/events/bulk/{envId}",
        RouteSpec::new(Js, Events(EventEndpoint::JsEvents)),
    ));
    routes.push(Route::new(
        post(),
        "/events/diagnostic/{envId}",
        RouteSpec::new(Js, Events(EventEndpoint::JsDiagnostic)),
    ));

    // Tracking pixel and goals passthrough
    routes.push(Route::new(get(), "/a/{envId}.gif", RouteSpec::new(Js, EventsImage)));
    routes.push(Route::new(get(), "/sdk/goals/{envId}", RouteSpec::new(Js, Goals)));

    RouteSet::new(routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use routing::Resolution;

    fn resolve(method: Method, path: &str) -> Option<RouteSpec> {
        match relay_routes().resolve(&method, path) {
            Resolution::Matched(m) => Some(*m.action),
            _ => None,
        }
    }

    #[test]
    fn representative_routes_resolve() {
        assert_eq!(
            resolve(Method::GET, "/status").unwrap().action,
            Action::Status
        );
        assert_eq!(
            resolve(Method::GET, "/sdk/evalx/57f4/users/eyJrIn0").unwrap(),
            RouteSpec::new(SdkKind::Js, Action::Evaluate { full: true })
        );
        assert_eq!(
            resolve(report(), "/msdk/eval/user").unwrap(),
            RouteSpec::new(SdkKind::Mobile, Action::Evaluate { full: false })
        );
        assert_eq!(
            resolve(Method::GET, "/all").unwrap(),
            RouteSpec::streaming(SdkKind::Server, Action::StreamAll)
        );
        assert_eq!(
            resolve(Method::POST, "/mobile/events/bulk").unwrap().action,
            Action::Events(EventEndpoint::MobileEvents)
        );
        assert_eq!(
            resolve(Method::GET, "/a/57f4.gif").unwrap().action,
            Action::EventsImage
        );
        assert_eq!(
            resolve(Method::GET, "/sdk/goals/57f4").unwrap().action,
            Action::Goals
        );
    }

    #[test]
    fn eval_stream_routes_are_ping_streams() {
        let spec = resolve(Method::GET, "/eval/57f4/eyJrIn0").unwrap();
        assert_eq!(spec.action, Action::StreamPing);
        assert!(spec.streaming);
        assert!(spec.is_cors());

        let spec = resolve(report(), "/meval").unwrap();
        assert_eq!(spec.action, Action::StreamPing);
        assert!(!spec.is_cors());
    }

    #[test]
    fn wrong_method_is_distinguished_from_unknown_path() {
        let routes = relay_routes();
        assert!(matches!(
            routes.resolve(&Method::POST, "/status"),
            Resolution::MethodNotAllowed { .. }
        ));
        assert!(matches!(
            routes.resolve(&Method::GET, "/not/a/route"),
            Resolution::NotFound
        ));
    }
}
