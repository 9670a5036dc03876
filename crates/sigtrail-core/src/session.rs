//! Signing context.
//!
//! The acting user, session and device are passed explicitly into every
//! sign, revoke and audit call. There is no ambient "current user".

/// Who is acting, from where.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionContext {
    /// Acting user id.
    pub user_id: i64,
    /// Login session identifier.
    pub session_id: Option<String>,
    /// Free-form device description.
    pub device_info: Option<String>,
    /// Client address.
    pub ip_address: Option<String>,
}

impl SessionContext {
    #[must_use]
    pub const fn new(user_id: i64) -> Self {
        Self {
            user_id,
            session_id: None,
            device_info: None,
            ip_address: None,
        }
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_device(mut self, device_info: impl Into<String>) -> Self {
        self.device_info = Some(device_info.into());
        self
    }

    #[must_use]
    pub fn with_ip(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }
}

/// Supplies the context of the caller currently acting.
pub trait SessionContextProvider: Send + Sync {
    /// Returns the current context.
    fn current(&self) -> SessionContext;
}

/// Provider that always returns the same context.
#[derive(Debug, Clone)]
pub struct FixedSessionProvider(SessionContext);

impl FixedSessionProvider {
    #[must_use]
    pub const fn new(context: SessionContext) -> Self {
        Self(context)
    }
}

impl SessionContextProvider for FixedSessionProvider {
    fn current(&self) -> SessionContext {
        self.0.clone()
    }
}
