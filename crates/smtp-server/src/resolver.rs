use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub preference: u16,
    pub exchange: String,
}

/// DNS lookups available to checkers. The server itself only uses
/// `reverse_lookup`, to fill in `Transaction::ptrs`.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup_ip(&self, name: &str) -> anyhow::Result<Vec<IpAddr>>;
    async fn lookup_txt(&self, name: &str) -> anyhow::Result<Vec<String>>;
    async fn lookup_mx(&self, name: &str) -> anyhow::Result<Vec<MxRecord>>;
    async fn reverse_lookup(&self, addr: IpAddr) -> anyhow::Result<Vec<String>>;
}

/// Uses the system resolver configuration
pub struct SystemResolver {
    inner: TokioResolver,
}

impl SystemResolver {
    pub fn new() -> anyhow::Result<Self> {
        let inner = TokioResolver::builder_tokio()?.build();
        Ok(Self { inner })
    }
}

fn strip_root(name: String) -> String {
    match name.strip_suffix('.') {
        Some(stripped) => stripped.to_string(),
        None => name,
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_ip(&self, name: &str) -> anyhow::Result<Vec<IpAddr>> {
        Ok(self.inner.lookup_ip(name).await?.iter().collect())
    }

    async fn lookup_txt(&self, name: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .inner
            .txt_lookup(name)
            .await?
            .iter()
            .map(|txt| txt.to_string())
            .collect())
    }

    async fn lookup_mx(&self, name: &str) -> anyhow::Result<Vec<MxRecord>> {
        let mut records: Vec<MxRecord> = self
            .inner
            .mx_lookup(name)
            .await?
            .iter()
            .map(|mx| MxRecord {
                preference: mx.preference(),
                exchange: strip_root(mx.exchange().to_string()),
            })
            .collect();
        records.sort_by_key(|mx| mx.preference);
        Ok(records)
    }

    async fn reverse_lookup(&self, addr: IpAddr) -> anyhow::Result<Vec<String>> {
        Ok(self
            .inner
            .reverse_lookup(addr)
            .await?
            .iter()
            .map(|ptr| strip_root(ptr.to_string()))
            .collect())
    }
}

/// Fails every lookup. Used when no system configuration is available.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableResolver;

#[async_trait]
impl Resolver for UnavailableResolver {
    async fn lookup_ip(&self, name: &str) -> anyhow::Result<Vec<IpAddr>> {
        anyhow::bail!("DNS is unavailable, cannot resolve {name}")
    }

    async fn lookup_txt(&self, name: &str) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("DNS is unavailable, cannot resolve TXT for {name}")
    }

    async fn lookup_mx(&self, name: &str) -> anyhow::Result<Vec<MxRecord>> {
        anyhow::bail!("DNS is unavailable, cannot resolve MX for {name}")
    }

    async fn reverse_lookup(&self, addr: IpAddr) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("DNS is unavailable, cannot resolve PTR for {addr}")
    }
}

/// The system resolver, or `UnavailableResolver` if the system
/// configuration could not be loaded.
pub fn default_resolver() -> Arc<dyn Resolver> {
    match SystemResolver::new() {
        Ok(resolver) => Arc::new(resolver),
        Err(err) => {
            tracing::warn!("system resolver is unavailable, DNS lookups will fail: {err:#}");
            Arc::new(UnavailableResolver)
        }
    }
}
