// Connection settings shared by the worker, the API and the CLI

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

impl RedisConfig {
    /// Read `REDIS_URL`, falling back to a local server.
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
        }
    }

    pub async fn connect(&self) -> redis::RedisResult<(redis::Client, redis::aio::ConnectionManager)> {
        let client = redis::Client::open(self.url.as_str())?;
        let conn = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok((client, conn))
    }
}
