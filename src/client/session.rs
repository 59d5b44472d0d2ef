use log::info;

use crate::backend::{AuthUser, Backend};
use crate::common::error::ChatResult;
use crate::common::models::{User, USERS};

/// Creates the account, then the directory profile other users discover it by.
pub async fn register(backend: &dyn Backend, name: &str, email: &str, password: &str) -> ChatResult<User> {
    let name = name.trim();
    let auth = backend.sign_up(email, password, name).await?;
    let display_name = if name.is_empty() {
        auth.email.split('@').next().unwrap_or(&auth.email).to_string()
    } else {
        name.to_string()
    };
    let profile = User::new_profile(&auth.uid, &display_name, &auth.email);
    backend.write_document(USERS, &auth.uid, profile.to_fields()?).await?;
    info!("[SESSION] Saved profile for {}", auth.uid);
    Ok(profile)
}

pub async fn login(backend: &dyn Backend, email: &str, password: &str) -> ChatResult<AuthUser> {
    let user = backend.sign_in(email, password).await?;
    info!("[SESSION] Logged in as {}", user.uid);
    Ok(user)
}

pub async fn logout(backend: &dyn Backend) -> ChatResult<()> {
    backend.sign_out().await?;
    info!("[SESSION] Logged out");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::common::error::{BackendError, ChatError};

    #[tokio::test]
    async fn test_register_writes_profile() {
        let backend = MemoryBackend::new();
        let user = register(&backend, " Ada ", "ada@example.com", "secret123").await.unwrap();
        assert_eq!(user.name, "Ada");
        assert_eq!(user.avatar, "");

        let doc = backend.get_document(USERS, &user.uid).await.unwrap().unwrap();
        assert_eq!(User::from_document(&doc).unwrap(), user);
        assert_eq!(backend.current_user().map(|u| u.uid), Some(user.uid));
    }

    #[tokio::test]
    async fn test_blank_name_falls_back_to_email() {
        let backend = MemoryBackend::new();
        let user = register(&backend, "  ", "grace@example.com", "secret123").await.unwrap();
        assert_eq!(user.name, "grace");
    }

    #[tokio::test]
    async fn test_login_failure_is_backend_error() {
        let backend = MemoryBackend::new();
        let err = login(&backend, "nobody@example.com", "secret123").await.unwrap_err();
        assert!(matches!(err, ChatError::Backend(BackendError::InvalidCredentials)));
        assert_eq!(err.to_string(), "invalid email or password");
    }

    #[tokio::test]
    async fn test_logout_clears_session() {
        let backend = MemoryBackend::new();
        register(&backend, "Ada", "ada@example.com", "secret123").await.unwrap();
        logout(&backend).await.unwrap();
        assert!(backend.current_user().is_none());
    }
}
