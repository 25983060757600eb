//! Counters for one server instance. Each instance owns its registry
//! so that several servers can live in the same process.
use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub(crate) struct ServerCounters {
    registry: Registry,
    pub bytes_read: IntCounter,
    pub bytes_written: IntCounter,
    pub transactions: IntCounter,
    pub messages_accepted: IntCounter,
    pub rejected_busy: IntCounter,
    active: IntGauge,
}

impl ServerCounters {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let bytes_read = IntCounter::new(
            "smtp_bytes_read_total",
            "total number of bytes received from clients",
        )?;
        let bytes_written = IntCounter::new(
            "smtp_bytes_written_total",
            "total number of bytes sent to clients",
        )?;
        let transactions = IntCounter::new(
            "smtp_transactions_total",
            "total number of connections admitted and served",
        )?;
        let messages_accepted = IntCounter::new(
            "smtp_messages_accepted_total",
            "total number of messages accepted by the handler pipeline",
        )?;
        let rejected_busy = IntCounter::new(
            "smtp_connections_rejected_busy_total",
            "total number of connections turned away because the server was full",
        )?;
        let active = IntGauge::new(
            "smtp_active_transactions",
            "number of transactions currently being served",
        )?;

        registry.register(Box::new(bytes_read.clone()))?;
        registry.register(Box::new(bytes_written.clone()))?;
        registry.register(Box::new(transactions.clone()))?;
        registry.register(Box::new(messages_accepted.clone()))?;
        registry.register(Box::new(rejected_busy.clone()))?;
        registry.register(Box::new(active.clone()))?;

        Ok(Self {
            registry,
            bytes_read,
            bytes_written,
            transactions,
            messages_accepted,
            rejected_busy,
            active,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn active(&self) -> i64 {
        self.active.get()
    }

    /// Count a new transaction; the returned guard keeps it
    /// in the active gauge until dropped.
    pub fn begin_transaction(&self) -> ActiveTransaction {
        self.transactions.inc();
        self.active.inc();
        ActiveTransaction {
            active: self.active.clone(),
        }
    }

    pub fn render(&self) -> anyhow::Result<String> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

pub(crate) struct ActiveTransaction {
    active: IntGauge,
}

impl Drop for ActiveTransaction {
    fn drop(&mut self) {
        self.active.dec();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn active_gauge_follows_guard() {
        let counters = ServerCounters::new().unwrap();
        let first = counters.begin_transaction();
        let second = counters.begin_transaction();
        assert_equal!(counters.active(), 2);
        drop(first);
        assert_equal!(counters.active(), 1);
        drop(second);
        assert_equal!(counters.active(), 0);
        assert_equal!(counters.transactions.get(), 2);
    }

    #[test]
    fn independent_registries() {
        let a = ServerCounters::new().unwrap();
        let b = ServerCounters::new().unwrap();
        a.bytes_read.inc_by(10);
        assert_equal!(b.bytes_read.get(), 0);

        let text = a.render().unwrap();
        assert!(text.contains("smtp_bytes_read_total 10"), "{text}");
    }
}
