//! Caller identity used for authentication and rate limiting

/// Who is calling. Never persisted beyond the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
    pub api_key: Option<String>,
    pub client_address: String,
}

impl RequestIdentity {
    pub fn new(api_key: Option<String>, client_address: impl Into<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()),
            client_address: client_address.into(),
        }
    }

    pub fn anonymous(client_address: impl Into<String>) -> Self {
        Self::new(None, client_address)
    }

    pub fn is_anonymous(&self) -> bool {
        self.api_key.is_none()
    }
}
