use std::path::{Path, PathBuf};

use axum::{
    body::Body,
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::AppState;

/// Serve files under the web root directly, skipping every later stage.
pub async fn serve_static(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return next.run(req).await;
    }

    let Some(path) = file_under(&state.config().web_root, req.uri().path()) else {
        return next.run(req).await;
    };
    if !tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()) {
        return next.run(req).await;
    }

    tracing::trace!(path = %path.display(), "Serving static file");
    match ServeFile::new(path).oneshot(req).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    }
}

/// Map a request path onto the web root, refusing anything that could climb
/// out of it.
fn file_under(web_root: &Path, request_path: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(request_path).ok()?;
    let mut path = web_root.to_path_buf();
    let mut any = false;
    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s if s.contains('\\') || s.contains('\0') => return None,
            s => {
                path.push(s);
                any = true;
            }
        }
    }
    any.then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_nested_paths() {
        let root = Path::new("/srv/wwwroot");
        assert_eq!(
            file_under(root, "/css/site.css"),
            Some(PathBuf::from("/srv/wwwroot/css/site.css"))
        );
        assert_eq!(
            file_under(root, "/img/a%20b.png"),
            Some(PathBuf::from("/srv/wwwroot/img/a b.png"))
        );
    }

    #[test]
    fn refuses_traversal_and_root() {
        let root = Path::new("/srv/wwwroot");
        assert_eq!(file_under(root, "/../etc/passwd"), None);
        assert_eq!(file_under(root, "/css/%2e%2e/%2e%2e/secret"), None);
        assert_eq!(file_under(root, "/a%5Cb"), None);
        assert_eq!(file_under(root, "/"), None);
    }
}
