use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, Method, header};
use std::net::SocketAddr;

// Client address: first hop of `X-Forwarded-For`, then `X-Real-IP` (only
// when the proxy is trusted), then the socket peer, then `"unknown"`.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
        let real = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = real {
            return ip.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn request_ip<B>(req: &axum::http::Request<B>, trust_proxy: bool) -> String {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    client_ip(req.headers(), peer, trust_proxy)
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// What the admission stages look at, pulled out of the request once.
#[derive(Debug, Clone)]
pub struct RequestFacts {
    pub ip: String,
    pub method: Method,
    pub path: String,
    pub url_len: usize,
    pub query_params: usize,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
    pub headers: HeaderMap,
}

impl RequestFacts {
    pub fn from_request(req: &Request, trust_proxy: bool) -> Self {
        let uri = req.uri();
        let headers = req.headers().clone();
        Self {
            ip: request_ip(req, trust_proxy),
            method: req.method().clone(),
            path: uri.path().to_string(),
            url_len: uri.path_and_query().map_or(0, |pq| pq.as_str().len()),
            query_params: uri
                .query()
                .map_or(0, |q| q.split('&').filter(|p| !p.is_empty()).count()),
            user_agent: header_str(&headers, header::USER_AGENT),
            accept_language: header_str(&headers, header::ACCEPT_LANGUAGE),
            headers,
        }
    }
}
