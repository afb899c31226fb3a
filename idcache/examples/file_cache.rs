use std::path::PathBuf;

use clap::Parser;
use idcache::{
    aliases::environment_of,
    lookup::AccessTokenQuery,
    persistence::{FileCachePersistence, PersistentCacheNotification},
    response::{SaveTokenRequest, TokenResponse},
    scope::ScopeSet,
    AccessTokenSecret, ClientId, TenantId, TokenCache,
};
use idcache_clock::DurationSecs;

#[derive(Debug, Parser)]
struct Opts {
    /// The authority tokens are issued by
    #[clap(short, long, env, default_value = "https://login.example.com/common/")]
    authority: String,

    /// The client ID of the client
    #[clap(short, long, env)]
    client_id: ClientId,

    /// The tenant to look tokens up in
    #[clap(short, long, env)]
    tenant_id: TenantId,

    /// The scopes to request, separated by spaces
    #[clap(short, long, env, default_value = "api://default/.default")]
    scopes: String,

    /// An access token to store when the cache has none
    #[clap(long, env, hide_env_values = true)]
    access_token: Option<AccessTokenSecret>,

    /// The lifetime of the stored access token, in seconds
    #[clap(long, env, default_value_t = 3600)]
    expires_in: u64,

    /// The local file used to persist the cache
    #[clap(short = 'f', long, env, default_value = ".token_cache.json")]
    cache_file: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let environment = environment_of(&opts.authority)
        .ok_or_else(|| color_eyre::eyre::eyre!("authority has no host: {}", opts.authority))?;
    let scopes = ScopeSet::parse(&opts.scopes);

    let notification =
        PersistentCacheNotification::new(FileCachePersistence::new(opts.cache_file.clone()));
    let cache = TokenCache::new(opts.client_id.clone()).with_notification(notification);

    let query = AccessTokenQuery {
        environment: &environment,
        client_id: &opts.client_id,
        tenant_id: Some(&opts.tenant_id),
        home_account_id: None,
        scopes: &scopes,
        key_id: None,
        token_type: None,
        obo_cache_key: None,
    };

    if let Some(found) = cache.find_access_token(&query).await? {
        tracing::info!(
            token = format_args!("{:#?}", found.token.secret()),
            expires_on = %found.token.expires_on(),
            outcome = ?found.outcome,
            "found cached access token"
        );
        return Ok(());
    }

    let access_token = match opts.access_token {
        Some(at) => at,
        None => {
            tracing::warn!("no cached access token and none supplied to store");
            return Ok(());
        }
    };

    let request = SaveTokenRequest::new(opts.authority.clone())
        .with_tenant_id(opts.tenant_id.clone())
        .with_scopes(scopes.clone());
    let response = TokenResponse {
        access_token: Some(access_token),
        expires_in: Some(DurationSecs(opts.expires_in)),
        ..TokenResponse::default()
    };

    let saved = cache.save_token_response(request, response).await?;
    tracing::info!(
        stored = saved.access_token.is_some(),
        file = %opts.cache_file.display(),
        "stored access token"
    );

    Ok(())
}
