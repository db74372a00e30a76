use std::sync::Arc;

use tracing::{debug, info};

use crate::api::{execute, ApiError, ApiRequest, RequestIssuer};
use crate::auth::SessionManager;
use crate::models::{
    decode_user, encode_registration, encode_user_update, Registration, User, UserUpdate,
};
use crate::utils::validation;

pub const REGISTER_ENDPOINT: &str = "/user/register";

/// Account operations that ride on an existing session's transport.
#[derive(Clone)]
pub struct ProfileService {
    transport: Arc<dyn RequestIssuer>,
    session: SessionManager,
}

impl ProfileService {
    pub fn new(session: SessionManager) -> Self {
        Self {
            transport: session.transport(),
            session,
        }
    }

    /// Apply a partial change to the signed-in user's profile.
    pub async fn update_profile(&self, update: &UserUpdate) -> Result<User, ApiError> {
        let Some(user_id) = self.session.user_id() else {
            return Err(ApiError::Validation("User ID is not set".to_string()));
        };
        if update.is_empty() {
            return Err(ApiError::Validation("No changes to update".to_string()));
        }
        if let Some(ref email) = update.email {
            if !validation::is_valid_email(email) {
                return Err(ApiError::Validation("Invalid email format".to_string()));
            }
        }
        if let Some(ref password) = update.password {
            if !validation::is_strong_password(password) {
                return Err(ApiError::Validation(
                    "Password does not meet strength requirements".to_string(),
                ));
            }
        }

        debug!(user_id, "Updating profile");
        let request =
            ApiRequest::put(format!("/update/{}", user_id)).with_json(encode_user_update(update));
        let reply = execute(self.transport.as_ref(), request).await?;
        let user = decode_user(&reply.body)?;
        info!(user_id = user.id, "Profile updated");
        Ok(user)
    }

    /// Create a new account. Does not sign the new user in.
    pub async fn register(&self, registration: &Registration) -> Result<User, ApiError> {
        if !validation::is_valid_email(&registration.email) {
            return Err(ApiError::Validation("Invalid email format".to_string()));
        }
        if !validation::is_strong_password(&registration.password) {
            return Err(ApiError::Validation(
                "Password does not meet strength requirements".to_string(),
            ));
        }
        if !validation::is_non_empty(registration.first_name.trim())
            || !validation::is_non_empty(registration.last_name.trim())
        {
            return Err(ApiError::Validation("First and last name are required".to_string()));
        }

        let request = ApiRequest::post(REGISTER_ENDPOINT)
            .with_json(encode_registration(registration))
            .without_reauth();
        let reply = execute(self.transport.as_ref(), request).await?;
        let user = decode_user(&reply.body)?;
        info!(user_id = user.id, "Registered new user");
        Ok(user)
    }
}
