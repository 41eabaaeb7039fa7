//! User authentication over an established SSH handshake.
//!
//! Supported flows:
//! - password
//! - password, falling back to keyboard-interactive (servers that only
//!   offer PAM-style prompts)
//! - public key, with an optional passphrase for encrypted keys

use std::sync::Arc;

use russh::client::{Handle, Handler, KeyboardInteractiveAuthResponse, Prompt};
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use tokio::sync::oneshot;

use crate::error::{Result, TransportError};
use crate::target::{AuthPrompt, ConnectOptions, ConnectTarget, Credentials, PromptRequest};

/// Upper bound on keyboard-interactive rounds before giving up.
const MAX_INTERACTIVE_ROUNDS: usize = 8;

/// Authenticates `handle` as `target.username`.
pub async fn authenticate<H: Handler>(
    handle: &mut Handle<H>,
    target: &ConnectTarget,
    credentials: &Credentials,
    options: &ConnectOptions,
) -> Result<()> {
    let accepted = match credentials {
        Credentials::Password(password) => {
            authenticate_password(handle, target, password, options).await?
        }
        Credentials::PrivateKey { pem, passphrase } => {
            authenticate_key(handle, target, pem, passphrase.as_deref()).await?
        }
    };

    if accepted {
        tracing::debug!(target = %target, "Authentication succeeded");
        Ok(())
    } else {
        tracing::warn!(target = %target, "Authentication rejected");
        Err(TransportError::AuthenticationFailed)
    }
}

async fn authenticate_password<H: Handler>(
    handle: &mut Handle<H>,
    target: &ConnectTarget,
    password: &str,
    options: &ConnectOptions,
) -> Result<bool> {
    let result = handle
        .authenticate_password(target.username.clone(), password.to_string())
        .await
        .map_err(auth_error)?;
    if result.success() {
        return Ok(true);
    }

    tracing::debug!(target = %target, "Password rejected, trying keyboard-interactive");
    authenticate_interactive(handle, target, password, options).await
}

async fn authenticate_interactive<H: Handler>(
    handle: &mut Handle<H>,
    target: &ConnectTarget,
    password: &str,
    options: &ConnectOptions,
) -> Result<bool> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(target.username.clone(), None::<String>)
        .await
        .map_err(auth_error)?;

    for _ in 0..MAX_INTERACTIVE_ROUNDS {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
            KeyboardInteractiveAuthResponse::InfoRequest {
                name,
                instructions,
                prompts,
            } => {
                let answers = answer_round(target, password, options, name, instructions, prompts)
                    .await?;
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(auth_error)?;
            }
        }
    }

    tracing::warn!(target = %target, "Too many keyboard-interactive rounds");
    Ok(false)
}

/// Produces the answers for one keyboard-interactive round.
///
/// With a prompter the round is forwarded and awaited; otherwise hidden
/// prompts get the password and echoed ones get an empty answer.
async fn answer_round(
    target: &ConnectTarget,
    password: &str,
    options: &ConnectOptions,
    name: String,
    instructions: String,
    prompts: Vec<Prompt>,
) -> Result<Vec<String>> {
    if prompts.is_empty() {
        return Ok(Vec::new());
    }

    let prompts: Vec<AuthPrompt> = prompts
        .into_iter()
        .map(|p| AuthPrompt {
            text: p.prompt,
            echo: p.echo,
        })
        .collect();

    match &options.prompter {
        Some(prompter) => {
            let (reply, answer) = oneshot::channel();
            let request = PromptRequest {
                target: target.clone(),
                name,
                instructions,
                prompts,
                reply,
            };
            prompter
                .send(request)
                .await
                .map_err(|_| TransportError::AuthenticationFailed)?;
            answer.await.map_err(|_| TransportError::AuthenticationFailed)
        }
        None => Ok(default_answers(&prompts, password)),
    }
}

fn default_answers(prompts: &[AuthPrompt], password: &str) -> Vec<String> {
    prompts
        .iter()
        .map(|p| {
            if p.echo {
                String::new()
            } else {
                password.to_string()
            }
        })
        .collect()
}

async fn authenticate_key<H: Handler>(
    handle: &mut Handle<H>,
    target: &ConnectTarget,
    pem: &str,
    passphrase: Option<&str>,
) -> Result<bool> {
    let key = decode_secret_key(pem, passphrase).map_err(|e| {
        tracing::warn!(target = %target, error = %e, "Failed to decode private key");
        TransportError::AuthenticationFailed
    })?;

    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .map_err(auth_error)?
        .flatten();

    let result = handle
        .authenticate_publickey(
            target.username.clone(),
            PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
        )
        .await
        .map_err(auth_error)?;
    Ok(result.success())
}

/// Errors during auth are connection problems unless the server said no.
fn auth_error(err: russh::Error) -> TransportError {
    match err {
        russh::Error::NotAuthenticated | russh::Error::NoAuthMethod => {
            TransportError::AuthenticationFailed
        }
        other => TransportError::from(other),
    }
}
