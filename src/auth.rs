use crate::policy::Principal;

/// Shared-secret gate for wire connections. Credential-to-identity
/// resolution lives upstream; the hello message carries the already-resolved
/// principal, and the secret proves the caller may speak to this daemon.
pub struct Gatekeeper {
    password: String,
}

impl Gatekeeper {
    pub fn new(password: String) -> Self {
        Self { password }
    }

    pub fn authenticate(
        &self,
        presented: &str,
        principal: Principal,
    ) -> Result<Principal, AuthError> {
        if presented == self.password {
            Ok(principal)
        } else {
            Err(AuthError::BadCredentials)
        }
    }
}

#[derive(Debug)]
pub enum AuthError {
    BadCredentials,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::BadCredentials => write!(f, "bad credentials"),
        }
    }
}

impl std::error::Error for AuthError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Role;
    use ulid::Ulid;

    #[test]
    fn password_gate() {
        let gate = Gatekeeper::new("sekrit".into());
        let principal = Principal {
            id: Ulid::new(),
            role: Role::Customer,
        };
        assert!(gate.authenticate("sekrit", principal).is_ok());
        assert!(gate.authenticate("nope", principal).is_err());
    }
}
