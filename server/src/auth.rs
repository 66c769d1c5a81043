//! Username/password check applied to every request.

use tonic::{Request, Status};

pub const USERNAME_HEADER: &str = "username";
pub const PASSWORD_HEADER: &str = "password";

/// Interceptor that admits every request when no credentials are configured,
/// and otherwise requires matching `username`/`password` metadata.
#[derive(Clone, Default)]
pub struct Authenticator {
    credentials: Option<(String, String)>,
}

impl Authenticator {
    pub fn open() -> Self {
        Self::default()
    }

    pub fn with_credentials(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Some((username.into(), password.into())),
        }
    }

    fn check(&self, request: &Request<()>) -> Result<(), Status> {
        let Some((username, password)) = &self.credentials else {
            return Ok(());
        };

        let metadata = request.metadata();
        let given_user = metadata.get(USERNAME_HEADER).and_then(|v| v.to_str().ok());
        let given_pass = metadata.get(PASSWORD_HEADER).and_then(|v| v.to_str().ok());

        if given_user == Some(username.as_str()) && given_pass == Some(password.as_str()) {
            Ok(())
        } else {
            Err(Status::unauthenticated("invalid username or password"))
        }
    }
}

impl tonic::service::Interceptor for Authenticator {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        self.check(&request)?;
        Ok(request)
    }
}
