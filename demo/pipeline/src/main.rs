// Pipeline Demo - Runs an Integration Interface End to End
// Orders flow source adapter -> transport -> destination adapter, with
// injected broker failures showing retries, deduplication, adaptive batching
// and the circuit breaker.

mod config;
mod flaky;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use colored::{ColoredString, Colorize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use batching::{AdaptiveBatcher, BatcherConfig};
use chrono::Utc;
use dedup::{DedupConfig, DeduplicationGuard, MemoryDedupStore};
use resilience::{CircuitBreakerConfig, CircuitState, ResilientExecutor, RetryPolicy};
use transport::{
    subscription_for_instance, topic_for_interface, AdapterType, Error, InFlightLockRecord,
    InMemoryBroker, InMemoryBrokerConfig, LockStatus, LockStore, MemoryLockStore, Message,
    MessageBroker, MessageTransport, TransportConfig,
};

use config::ScenarioConfig;
use flaky::FlakyBroker;

const CUSTOMERS: [&str; 6] = [
    "Nordwind Logistics",
    "Acme Industrial",
    "Blue Harbor Foods",
    "Vektor Machinery",
    "Solstice Retail",
    "Pinewood Pharma",
];

struct PipelineDemo {
    scenario: ScenarioConfig,
    memory: Arc<InMemoryBroker>,
    broker: Arc<FlakyBroker>,
    lock_store: Arc<MemoryLockStore>,
    executor: Arc<ResilientExecutor>,
    transport: MessageTransport,
    guard: DeduplicationGuard,
    batcher: AdaptiveBatcher,
    source_instance: Uuid,
    destination_instance: Uuid,
    cancel: CancellationToken,
    completed: u64,
    retried: u64,
    dead_lettered: u64,
    duplicates_dropped: u64,
}

impl PipelineDemo {
    fn new(scenario: ScenarioConfig) -> Self {
        let memory = Arc::new(InMemoryBroker::new(InMemoryBrokerConfig::default()));
        let broker = Arc::new(FlakyBroker::new(Arc::clone(&memory), scenario.send_failures));
        let lock_store = Arc::new(MemoryLockStore::new());
        let executor = Arc::new(ResilientExecutor::new(CircuitBreakerConfig {
            failure_threshold: scenario.breaker_failure_threshold,
            open_duration: Duration::from_secs(scenario.breaker_open_seconds),
            success_threshold: 1,
        }));

        let transport = MessageTransport::new(
            Arc::clone(&broker) as Arc<dyn MessageBroker>,
            Arc::clone(&lock_store) as Arc<dyn LockStore>,
            Arc::clone(&executor),
            TransportConfig {
                retry_policy: RetryPolicy {
                    max_retries: 4,
                    initial_delay: Duration::from_millis(100),
                    max_delay: Duration::from_secs(1),
                    ..RetryPolicy::default()
                },
                ..TransportConfig::default()
            },
        );

        Self {
            scenario,
            memory,
            broker,
            lock_store,
            executor,
            transport,
            guard: DeduplicationGuard::new(Arc::new(MemoryDedupStore::new()), DedupConfig::default()),
            batcher: AdaptiveBatcher::new(BatcherConfig::default()),
            source_instance: Uuid::new_v4(),
            destination_instance: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            completed: 0,
            retried: 0,
            dead_lettered: 0,
            duplicates_dropped: 0,
        }
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        println!("\n🚀 =================================================================");
        println!("🚀 Datarail Transport - Pipeline Demo");
        println!("🚀 Demonstrating: resilient delivery for an integration interface");
        println!("🚀 =================================================================\n");

        println!("📊 Interface: {}", self.scenario.interface_name);
        println!(
            "📊 Orders: {} ({} of them duplicates)",
            self.scenario.order_count, self.scenario.duplicate_count
        );
        println!(
            "📊 Injected transient send failures: {}",
            self.scenario.send_failures
        );

        self.stage_boot_recovery().await?;
        self.stage_register_destination().await?;
        self.stage_publish().await?;
        self.stage_consume().await?;
        self.stage_adaptive_sizing();
        self.stage_outage().await?;
        self.show_summary().await;
        Ok(())
    }

    /// Boot sweep over lock records a crashed predecessor left behind
    async fn stage_boot_recovery(&self) -> anyhow::Result<()> {
        stage(1, "Boot recovery sweep");

        // Simulate a record from a previous run. Its subscription no longer
        // exists on the broker, so the sweep marks it released.
        let orphan = InFlightLockRecord {
            message_id: Uuid::new_v4(),
            lock_token: Uuid::new_v4(),
            topic_name: topic_for_interface(&self.scenario.interface_name),
            subscription_name: subscription_for_instance(Uuid::new_v4()),
            interface_name: self.scenario.interface_name.clone(),
            destination_instance_id: Uuid::new_v4(),
            delivery_count: 1,
            locked_until: Utc::now() - chrono::Duration::seconds(120),
            status: LockStatus::Locked,
            recorded_at: Utc::now() - chrono::Duration::seconds(150),
        };
        self.lock_store.record_lock(orphan).await?;

        let report = self.transport.recover_stale_locks(&self.cancel).await?;
        println!(
            "  🔁 stale lock records: {} recovered, {} already released, {} skipped",
            report.recovered, report.already_released, report.skipped
        );
        println!("     (the skipped record's subscription is gone, it was marked released)");
        Ok(())
    }

    async fn stage_register_destination(&self) -> anyhow::Result<()> {
        stage(2, "Destination registration");

        let subscription = self
            .transport
            .register_destination(&self.scenario.interface_name, self.destination_instance)
            .await?;
        println!(
            "  📬 topic {} fans out to subscription {}",
            topic_for_interface(&self.scenario.interface_name).green(),
            subscription.green()
        );
        Ok(())
    }

    /// Source side: dedup, cut batches, publish with retries
    async fn stage_publish(&mut self) -> anyhow::Result<()> {
        stage(3, "Source adapter publishes");

        let orders = self.generate_orders();
        println!("  📦 export produced {} order records", orders.len());

        let mut fresh = Vec::new();
        for record in orders {
            let key = self.guard.generate_key(
                &record,
                &self.scenario.interface_name,
                Some(self.source_instance),
            );
            if self.guard.is_duplicate(&key, None).await {
                self.duplicates_dropped += 1;
                continue;
            }
            self.guard
                .mark_processed(&key, &self.scenario.interface_name, "erp-export")
                .await;
            fresh.push(record);
        }
        println!(
            "  🧹 dedup guard dropped {}, {} left to publish",
            self.duplicates_dropped,
            fresh.len()
        );

        let total_bytes: usize = fresh
            .iter()
            .filter_map(|r| serde_json::to_vec(r).ok())
            .map(|v| v.len())
            .sum();
        let avg_size = if fresh.is_empty() {
            None
        } else {
            Some(total_bytes / fresh.len())
        };
        let hint = self.batcher.optimal_batch_size(
            &self.scenario.interface_name,
            self.scenario.batch_size,
            avg_size,
        );
        let batches =
            self.batcher
                .create_batches(fresh, &self.scenario.interface_name, Some(hint), None, None);
        println!(
            "  ✂️  cut into {} batch(es) of up to {} records",
            batches.len(),
            hint
        );

        for (idx, batch) in batches.into_iter().enumerate() {
            let started = Instant::now();
            let count = batch.len();
            let messages: Vec<Message> = batch
                .into_iter()
                .map(|record| self.order_message(record))
                .collect();

            match self.transport.send_batch(messages, &self.cancel).await {
                Ok(outcome) => {
                    self.batcher.record_batch_performance(
                        &self.scenario.interface_name,
                        count,
                        started.elapsed(),
                        true,
                    );
                    println!(
                        "  ✅ [{}ms] batch {} {}: {} sent, {} rejected",
                        started.elapsed().as_millis(),
                        idx + 1,
                        "OK".green(),
                        outcome.sent.len(),
                        outcome.rejected.len()
                    );
                }
                Err(err) => {
                    self.batcher.record_batch_performance(
                        &self.scenario.interface_name,
                        count,
                        started.elapsed(),
                        false,
                    );
                    println!("  ❌ batch {} {}: {}", idx + 1, "FAILED".red(), err);
                }
            }
            sleep(Duration::from_millis(150)).await;
        }
        Ok(())
    }

    /// Destination side: peek-lock receive, then complete, abandon or
    /// dead-letter each delivery
    async fn stage_consume(&mut self) -> anyhow::Result<()> {
        stage(4, "Destination adapter consumes under peek-lock");

        let mut failed_once: HashSet<String> = HashSet::new();
        loop {
            let messages = self
                .transport
                .receive(
                    &self.scenario.interface_name,
                    self.destination_instance,
                    4,
                    &self.cancel,
                )
                .await?;
            if messages.is_empty() {
                break;
            }

            for message in messages {
                let Some(token) = message.lock_token else { continue };
                let order_id = message.record.get("order_id").cloned().unwrap_or_default();
                let amount = message.record.get("amount").cloned().unwrap_or_default();

                if amount == "not-a-number" {
                    self.transport
                        .dead_letter(message.message_id, token, "amount is not numeric", &self.cancel)
                        .await?;
                    self.dead_lettered += 1;
                    println!(
                        "  ✖  {} {}: amount is not numeric",
                        order_id,
                        "DEAD-LETTERED".red()
                    );
                } else if order_id == "ORD-1001" && failed_once.insert(order_id.clone()) {
                    self.transport
                        .abandon(message.message_id, token, &self.cancel)
                        .await?;
                    self.retried += 1;
                    println!(
                        "  ↻  {} target busy, released for redelivery",
                        order_id.yellow()
                    );
                } else {
                    self.transport
                        .complete(message.message_id, token, &self.cancel)
                        .await?;
                    self.completed += 1;
                    if message.delivery_count > 1 {
                        println!(
                            "  ✓  {} {} on delivery {} (amount {})",
                            order_id,
                            "imported".green(),
                            message.delivery_count,
                            amount
                        );
                    } else {
                        println!("  ✓  {} {} (amount {})", order_id, "imported".green(), amount);
                    }
                }
            }
            sleep(Duration::from_millis(100)).await;
        }

        println!(
            "  🧾 imported {}, retried {}, dead-lettered {}",
            self.completed, self.retried, self.dead_lettered
        );
        Ok(())
    }

    /// Throughput history converges the batch size toward the learned optimal
    fn stage_adaptive_sizing(&self) {
        stage(5, "Adaptive batch sizing");
        let interface = &self.scenario.interface_name;

        // Overnight throughput: steady 120-record batches at ~400ms each
        for _ in 0..12 {
            self.batcher
                .record_batch_performance(interface, 120, Duration::from_millis(400), true);
        }

        if let Some(stats) = self.batcher.stats(interface) {
            println!(
                "  📈 after {} successful batches: optimal size {}, avg {:.0} records/batch in {:?}",
                stats.processed_batches,
                stats.optimal_batch_size,
                stats.average_records_per_batch,
                stats.average_processing_time
            );
        }
        let next = self
            .batcher
            .optimal_batch_size(interface, self.scenario.batch_size, Some(320));
        println!(
            "  📈 next publish would use {} records (configured hint was {})",
            next, self.scenario.batch_size
        );
    }

    /// An outage on a second interface trips its breaker without touching
    /// the order traffic
    async fn stage_outage(&self) -> anyhow::Result<()> {
        stage(6, "Broker outage trips the circuit breaker");

        let interface = "InventorySync";
        let attempts = self.scenario.breaker_failure_threshold + 1;
        self.broker.set_outage(true);
        println!(
            "  🔌 broker outage injected, publishing {} inventory updates",
            attempts
        );

        for i in 0..attempts {
            match self
                .transport
                .send(self.inventory_message(interface, i), &self.cancel)
                .await
            {
                Ok(_) => println!("  ✅ update {} sent", i + 1),
                Err(Error::CircuitOpen {
                    operation_key,
                    retry_in,
                }) => {
                    println!(
                        "  ⛔ update {} rejected without a broker call: {} is {}, retry in {:?}",
                        i + 1,
                        operation_key,
                        "OPEN".red().bold(),
                        retry_in
                    );
                }
                Err(err) => println!("  ❌ update {} failed after retries: {}", i + 1, err),
            }
        }

        let outage_key = format!("send:{}", interface);
        let orders_key = format!("send-batch:{}", self.scenario.interface_name);
        println!(
            "  🔍 breaker {} is {}",
            outage_key,
            state_label(self.breaker(&outage_key))
        );
        println!(
            "  🔍 breaker {} is {} (keys are isolated)",
            orders_key,
            state_label(self.breaker(&orders_key))
        );

        self.broker.set_outage(false);
        println!(
            "  🔧 outage repaired, waiting {}s for the open window to lapse",
            self.scenario.breaker_open_seconds
        );
        sleep(Duration::from_secs(self.scenario.breaker_open_seconds)).await;

        match self
            .transport
            .send(self.inventory_message(interface, attempts), &self.cancel)
            .await
        {
            Ok(_) => println!(
                "  ✅ probe publish succeeded, breaker is {}",
                state_label(self.breaker(&outage_key))
            ),
            Err(err) => println!("  ❌ probe publish failed: {}", err),
        }
        Ok(())
    }

    async fn show_summary(&self) {
        println!("\n📈 =================================================================");
        println!("📈 PIPELINE SUMMARY");
        println!("📈 =================================================================\n");

        let topic = topic_for_interface(&self.scenario.interface_name);
        let subscription = subscription_for_instance(self.destination_instance);
        let dead = self.memory.dead_letters(&topic, &subscription);

        println!("  ✅ Imported: {}", self.completed);
        println!("  ↻  Redelivered once: {}", self.retried);
        println!("  🧹 Duplicates dropped: {}", self.duplicates_dropped);
        println!("  ✖  Dead-lettered: {}", self.dead_lettered);
        for (message, reason) in &dead {
            println!("      {} -> {}", message.message_id, reason);
        }
        println!("  🔒 Lock records written: {}", self.lock_store.len());
        println!("  🗂  Dedup cache entries: {}", self.guard.cache_len());

        self.transport.shutdown().await;
        println!("\n🎉 Pipeline demo complete.\n");
    }

    fn generate_orders(&self) -> Vec<HashMap<String, String>> {
        let fresh_count = self
            .scenario
            .order_count
            .saturating_sub(self.scenario.duplicate_count)
            .max(1);
        let mut orders = Vec::with_capacity(self.scenario.order_count);
        for i in 0..fresh_count {
            let mut record = HashMap::new();
            record.insert("order_id".to_string(), format!("ORD-{}", 1001 + i));
            record.insert(
                "customer".to_string(),
                CUSTOMERS[i % CUSTOMERS.len()].to_string(),
            );
            let amount = if i == 2 {
                // A poison record the destination cannot import
                "not-a-number".to_string()
            } else {
                format!("{}.90", 120 + 35 * i)
            };
            record.insert("amount".to_string(), amount);
            record.insert("currency".to_string(), "EUR".to_string());
            orders.push(record);
        }
        for i in 0..self.scenario.duplicate_count {
            orders.push(orders[i % fresh_count].clone());
        }
        orders
    }

    fn order_message(&self, record: HashMap<String, String>) -> Message {
        let mut headers: Vec<String> = record.keys().cloned().collect();
        headers.sort();
        Message::new(
            self.scenario.interface_name.as_str(),
            "erp-export",
            AdapterType::Source,
            self.source_instance,
            headers,
            record,
        )
    }

    fn inventory_message(&self, interface: &str, index: u32) -> Message {
        let mut record = HashMap::new();
        record.insert("sku".to_string(), format!("SKU-{:04}", 7 + index));
        record.insert("on_hand".to_string(), (40 + index * 3).to_string());
        Message::new(
            interface,
            "wms-export",
            AdapterType::Source,
            self.source_instance,
            vec!["on_hand".to_string(), "sku".to_string()],
            record,
        )
    }

    fn breaker(&self, operation_key: &str) -> Option<CircuitState> {
        self.executor.breaker_state(operation_key).map(|s| s.state)
    }
}

fn stage(number: usize, title: &str) {
    println!();
    println!(
        "{} {}",
        format!("▶ Stage {}/6:", number).magenta().bold(),
        title.bold()
    );
}

fn state_label(state: Option<CircuitState>) -> ColoredString {
    match state {
        Some(CircuitState::Open) => "OPEN".red().bold(),
        Some(CircuitState::HalfOpen) => "HALF-OPEN".yellow(),
        Some(CircuitState::Closed) => "CLOSED".green(),
        None => "NO TRAFFIC YET".normal(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let scenario = if let Ok(path) = std::env::var("PIPELINE_SCENARIO") {
        info!("Loading scenario from: {}", path);
        ScenarioConfig::from_file(&path)?
    } else {
        info!("Using the built-in scenario");
        ScenarioConfig::default()
    };

    let mut demo = PipelineDemo::new(scenario);
    demo.run().await
}
