use crate::http::make_boxed_error_response;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Serves `/health`, `/ready` and `/metrics`.
///
/// `render_metrics` is only invoked for scrapes of `/metrics`.
pub struct AdminService<F, R> {
    is_ready: F,
    render_metrics: R,
}

impl<F, R> AdminService<F, R>
where
    F: Fn() -> bool,
    R: Fn() -> String,
{
    pub fn new(is_ready: F, render_metrics: R) -> Self {
        Self {
            is_ready,
            render_metrics,
        }
    }
}

impl<F, R> Service<Request<Incoming>> for AdminService<F, R>
where
    F: Fn() -> bool + Send + 'static,
    R: Fn() -> String + Send + 'static,
{
    type Response = Response<BoxBody<Bytes, Infallible>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let ok_body = || Full::new(Bytes::from("ok\n")).boxed();

        let res = match req.uri().path() {
            "/health" => Response::new(ok_body()),
            "/ready" => match (self.is_ready)() {
                true => Response::new(ok_body()),
                false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
            },
            "/metrics" => {
                let mut response =
                    Response::new(Full::new(Bytes::from((self.render_metrics)())).boxed());
                if let Ok(value) = METRICS_CONTENT_TYPE.parse() {
                    response.headers_mut().insert(CONTENT_TYPE, value);
                }
                response
            }
            _ => make_boxed_error_response(StatusCode::NOT_FOUND),
        };

        Box::pin(async move { Ok(res) })
    }
}
