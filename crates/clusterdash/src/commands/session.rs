use secrecy::SecretString;

use clusterdash_core::Dashboard;

use crate::cli::LoginArgs;
use crate::error::{CliError, login_error};

pub async fn login(dashboard: &Dashboard, args: &LoginArgs) -> Result<(), CliError> {
    let password = match args.password_env {
        Some(ref var) => std::env::var(var).map_err(|_| CliError::Validation {
            field: "password-env".into(),
            reason: format!("environment variable {var} is not set"),
        })?,
        None => rpassword::prompt_password("Password: ")?,
    };
    let password = SecretString::from(password);

    dashboard
        .login(&args.username, &password)
        .await
        .map_err(login_error)?;

    eprintln!("Logged in as {}", args.username);
    Ok(())
}

pub fn logout(dashboard: &Dashboard) -> Result<(), CliError> {
    dashboard.logout()?;
    eprintln!("Logged out");
    Ok(())
}
