//! User profile endpoint (/users/me)

use anyhow::Result;

use super::client::{ClientOptions, HarajClient};

/// Fetch and display current user info.
pub async fn whoami(options: &ClientOptions) -> Result<()> {
    let client = HarajClient::connect(options)?;
    let me = client.me().await?;

    println!();
    println!("Name:     {}", me.name.as_deref().unwrap_or("(none)"));
    println!("Email:    {}", me.email.as_deref().unwrap_or("(none)"));
    println!("Phone:    {}", me.phone.as_deref().unwrap_or("(none)"));
    println!("City:     {}", me.city.as_deref().unwrap_or("(none)"));
    println!("Verified: {}", if me.is_verified { "yes" } else { "no" });
    println!("ID:       {}", me.id);

    Ok(())
}
