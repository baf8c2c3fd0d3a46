use std::net::IpAddr;
use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use http::Request;

/// Best-effort client address for keying per-client limiters.
///
/// Uses the first valid address in `X-Forwarded-For`, then `X-Real-IP`, then
/// the peer address recorded by axum's `ConnectInfo`. Returns an empty string
/// when none is available, so such requests share one limiter.
pub fn client_ip<B>(req: &Request<B>) -> String {
    let headers = req.headers();

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(parse_ip);
    let real = || {
        headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_ip)
    };
    let peer = || {
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    };

    forwarded
        .or_else(real)
        .or_else(peer)
        .map(|ip| ip.to_string())
        .unwrap_or_default()
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    value.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> http::request::Builder {
        Request::builder().uri("/limit3")
    }

    #[test]
    fn prefers_the_first_forwarded_hop() {
        let req = request()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .header("x-real-ip", "198.51.100.2")
            .body(())
            .unwrap();
        assert_eq!(client_ip(&req), "203.0.113.7");
    }

    #[test]
    fn falls_back_to_real_ip_then_peer() {
        let req = request()
            .header("x-forwarded-for", "not-an-ip")
            .header("x-real-ip", " 198.51.100.2 ")
            .body(())
            .unwrap();
        assert_eq!(client_ip(&req), "198.51.100.2");

        let mut req = request().body(()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4242))));
        assert_eq!(client_ip(&req), "127.0.0.1");
    }

    #[test]
    fn unknown_clients_share_the_empty_key() {
        let req = request().body(()).unwrap();
        assert_eq!(client_ip(&req), "");
    }
}
