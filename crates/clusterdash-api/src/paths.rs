// Endpoint construction.
//
// The dashboard may be deployed behind a reverse proxy at a non-root
// path, so every HTTP and WebSocket target is qualified with a single
// configurable base path prefix.

use url::Url;

use crate::error::Error;

/// Concatenate path segments with single forward slashes.
///
/// Backslashes are normalized, empty segments dropped, and runs of
/// slashes collapsed. Do not pass a scheme (`http://`): its double slash
/// would be collapsed too.
pub fn join_paths<S: AsRef<str>>(paths: &[S]) -> String {
    let joined = paths
        .iter()
        .map(|p| p.as_ref().trim().replace('\\', "/"))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/");

    let mut out = String::with_capacity(joined.len());
    let mut prev_slash = false;
    for ch in joined.chars() {
        if ch == '/' {
            if !prev_slash {
                out.push(ch);
            }
            prev_slash = true;
        } else {
            out.push(ch);
            prev_slash = false;
        }
    }
    out
}

/// Resolves resource paths against the server origin and base path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    server: Url,
    base_path: String,
}

impl Endpoints {
    /// `server` is the origin (`https://dash.example.com`); `base_path` is
    /// the deployment prefix (`/` or `/dashboard`).
    pub fn new(server: Url, base_path: &str) -> Self {
        let mut base_path = join_paths(&["/", base_path]);
        if !base_path.starts_with('/') {
            base_path.insert(0, '/');
        }
        Self { server, base_path }
    }

    pub fn server(&self) -> &Url {
        &self.server
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Full HTTP URL for a resource path, e.g. `api/nodes`.
    pub fn http(&self, path: &str) -> Result<Url, Error> {
        let full = join_paths(&[self.base_path.as_str(), path]);
        Ok(self.server.join(&full)?)
    }

    /// Full WebSocket URL for a stream path, e.g. `websocket/workload`.
    ///
    /// `http` maps to `ws` and `https` to `wss`.
    pub fn ws(&self, path: &str) -> Result<Url, Error> {
        let mut url = self.http(path)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| Error::WebSocketConnect(format!("cannot derive ws URL from {url}")))?;
        Ok(url)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn join_collapses_slashes() {
        assert_eq!(join_paths(&["/", "api/nodes"]), "/api/nodes");
        assert_eq!(join_paths(&["/dash/", "/api//nodes"]), "/dash/api/nodes");
        assert_eq!(join_paths(&["", " ", "logs"]), "logs");
        assert_eq!(join_paths(&["a\\b", "c"]), "a/b/c");
    }

    #[test]
    fn http_url_respects_base_path() {
        let server = Url::parse("http://localhost:8000").unwrap();
        let root = Endpoints::new(server.clone(), "/");
        assert_eq!(
            root.http("api/nodes").unwrap().as_str(),
            "http://localhost:8000/api/nodes"
        );

        let proxied = Endpoints::new(server, "dashboard");
        assert_eq!(proxied.base_path(), "/dashboard");
        assert_eq!(
            proxied.http("/api/get-kernels").unwrap().as_str(),
            "http://localhost:8000/dashboard/api/get-kernels"
        );
    }

    #[test]
    fn ws_url_switches_scheme() {
        let secure = Endpoints::new(Url::parse("https://cluster.example.com").unwrap(), "/d");
        assert_eq!(
            secure.ws("websocket/workload").unwrap().as_str(),
            "wss://cluster.example.com/d/websocket/workload"
        );

        let plain = Endpoints::new(Url::parse("http://127.0.0.1:9000").unwrap(), "/");
        assert_eq!(plain.ws("logs").unwrap().as_str(), "ws://127.0.0.1:9000/logs");
    }
}
