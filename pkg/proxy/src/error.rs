use thiserror::Error;

/// Why a request could not be routed. Every variant is answered with a 502
/// and the message as a plain-text body.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no route")]
    NoRoute,
    #[error("unidle timeout")]
    UnidleTimeout,
    #[error("unidle failed: {0}")]
    Unidle(anyhow::Error),
    #[error("storage error: {0}")]
    Storage(anyhow::Error),
    #[error("invalid target {target}: {error}")]
    InvalidTarget { target: String, error: anyhow::Error },
}

impl RouteError {
    pub fn status(&self) -> u16 {
        502
    }

    pub fn body(&self) -> String {
        format!("{}\n", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_route_body() {
        assert_eq!(RouteError::NoRoute.body(), "no route\n");
        assert_eq!(RouteError::NoRoute.status(), 502);
    }

    #[test]
    fn test_wrapped_errors_keep_message() {
        let err = RouteError::Storage(anyhow::anyhow!("table unavailable"));
        assert_eq!(err.body(), "storage error: table unavailable\n");
        assert_eq!(RouteError::UnidleTimeout.status(), 502);
    }
}
