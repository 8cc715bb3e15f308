//! Workload generator for exercising the relay reactor in-process.
//!
//! This binary starts N reactors wired by channel transports, registers G
//! replicated groups on every node with leaders spread round-robin, drives
//! batched proposals against the leaders, fans applied entries out through
//! each leader's outbox, and writes a JSON run summary.

use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures_util::stream::{FuturesUnordered, StreamExt};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use relay_reactor::reactor::{
    AckMode, ChannelTransport, Envelope, Handler, LogEntry, LogReplica, MemoryStorage, NodeId,
    OutboundConfig, OutboundForwarder, Outbox, Reactor, ReactorConfig, ReactorError, ReplicaConfig,
    UserMessage,
};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "relay-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of in-process nodes.
    #[arg(long, env = "RELAY_NODES", default_value_t = 3)]
    nodes: usize,

    /// Number of replicated groups registered on every node.
    #[arg(long, env = "RELAY_GROUPS", default_value_t = 16)]
    groups: usize,

    /// Sub-reactor loops per node.
    #[arg(long, env = "RELAY_SUB_REACTORS", default_value_t = 4)]
    sub_reactors: usize,

    /// Number of concurrent proposing clients.
    #[arg(long, default_value_t = 8)]
    clients: usize,

    /// Entries per proposal.
    #[arg(long, default_value_t = 4)]
    batch: usize,

    /// Smallest payload in bytes.
    #[arg(long, default_value_t = 32)]
    payload_min: usize,

    /// Largest payload in bytes.
    #[arg(long, default_value_t = 512)]
    payload_max: usize,

    /// Commit policy for the groups: none, majority or all.
    #[arg(long, env = "RELAY_ACK_MODE", default_value = "majority")]
    ack_mode: AckMode,

    /// Reactor and outbox tick interval.
    #[arg(long, env = "RELAY_TICK_INTERVAL", default_value = "20ms")]
    tick_interval: humantime::Duration,

    /// Total runtime for the workload.
    #[arg(long, default_value = "10s")]
    duration: humantime::Duration,

    /// Per-proposal wait timeout.
    #[arg(long, default_value = "5s")]
    op_timeout: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// When true, any failed proposal aborts the run.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    fail_fast: bool,

    /// Log per-phase loop timings slower than 1ms.
    #[arg(long, default_value_t = false)]
    lazy_catch_up: bool,

    /// Write the JSON run summary to this path.
    #[arg(long, default_value = ".tmp/relay/summary.json")]
    out: PathBuf,
}

/// Metadata embedded in the summary for reproducibility.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct SummaryMeta {
    nodes: usize,
    groups: usize,
    sub_reactors: usize,
    clients: usize,
    batch: usize,
    ack_mode: String,
    duration_ms: u64,
    seed: u64,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Default)]
struct LatencySummary {
    p50_us: u64,
    p95_us: u64,
    p99_us: u64,
    max_us: u64,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct GroupSummary {
    key: String,
    leader: NodeId,
    last_index: u64,
    applied_index: u64,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct OutboxSummary {
    node: NodeId,
    last_index: u64,
    commit_index: u64,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct Summary {
    meta: SummaryMeta,
    proposals_ok: u64,
    proposals_failed: u64,
    entries_applied: u64,
    errors: HashMap<String, u64>,
    latency: LatencySummary,
    forwarded_messages: u64,
    dropped_envelopes: u64,
    groups: Vec<GroupSummary>,
    outboxes: Vec<OutboxSummary>,
}

/// Outcome of one client's run.
#[derive(Default)]
struct ClientReport {
    ok: u64,
    failed: u64,
    entries: u64,
    latencies_us: Vec<u64>,
    errors: HashMap<String, u64>,
}

/// Ack from a peer: `(sender, acking node, index)`.
type Ack = (NodeId, NodeId, u64);

/// Delivers outbound batches to a peer in-process and acks them back.
struct LoopbackForwarder {
    from: NodeId,
    delivered: Arc<AtomicU64>,
    acks: mpsc::UnboundedSender<Ack>,
}

#[async_trait]
impl OutboundForwarder for LoopbackForwarder {
    async fn forward(&self, to: NodeId, messages: Vec<UserMessage>) -> anyhow::Result<()> {
        let Some(last) = messages.last().map(|m| m.index) else {
            return Ok(());
        };
        self.delivered
            .fetch_add(messages.len() as u64, Ordering::Relaxed);
        self.acks
            .send((self.from, to, last))
            .map_err(|_| anyhow::anyhow!("ack channel closed"))
    }
}

/// Nodes, their outboxes and the background tasks wiring them together.
struct Cluster {
    reactors: HashMap<NodeId, Arc<Reactor>>,
    outboxes: HashMap<NodeId, Arc<Outbox>>,
    groups: Vec<(String, NodeId)>,
    delivered: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

#[tokio::main]
/// Parse CLI args and dispatch to the selected subcommand.
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

fn init_tracing() {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Run the workload and write the summary file.
async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.nodes > 0, "--nodes must be > 0");
    anyhow::ensure!(args.groups > 0, "--groups must be > 0");
    anyhow::ensure!(args.clients > 0, "--clients must be > 0");
    anyhow::ensure!(args.batch > 0, "--batch must be > 0");
    anyhow::ensure!(
        args.payload_min <= args.payload_max,
        "--payload-min must be <= --payload-max"
    );

    let duration: Duration = args.duration.into();
    // Use a random seed when the user provides zero.
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };

    let cluster = Arc::new(start_cluster(&args)?);
    tracing::info!(
        nodes = args.nodes,
        groups = args.groups,
        seed,
        "cluster started"
    );

    let stop = cluster.shutdown.child_token();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, finishing run");
                stop.cancel();
            }
        });
    }

    let deadline = time::Instant::now() + duration;
    let mut clients = FuturesUnordered::new();
    for client_id in 0..args.clients {
        let cluster = cluster.clone();
        let args = args.clone();
        let stop = stop.clone();
        // Mix the base seed with the client id for deterministic per-client RNG.
        let seed = seed ^ (client_id as u64).wrapping_mul(0x9e3779b97f4a7c15);
        clients.push(tokio::spawn(async move {
            run_client(client_id, cluster, args, seed, deadline, stop).await
        }));
    }

    let mut reports = Vec::with_capacity(args.clients);
    while let Some(res) = clients.next().await {
        reports.push(res.context("client task panicked")??);
    }

    drain_outboxes(&cluster, Duration::from_secs(5)).await;
    let summary = summarize(&args, seed, &cluster, reports);
    stop_cluster(&cluster).await;

    tracing::info!(
        ok = summary.proposals_ok,
        failed = summary.proposals_failed,
        p99_us = summary.latency.p99_us,
        forwarded = summary.forwarded_messages,
        "workload finished"
    );
    write_summary(&args.out, &summary).context("write summary")?;
    eprintln!("wrote summary: {}", args.out.display());
    Ok(())
}

fn start_cluster(args: &RunArgs) -> anyhow::Result<Cluster> {
    let node_ids: Vec<NodeId> = (1..=args.nodes as NodeId).collect();
    let shutdown = CancellationToken::new();
    let tick: Duration = args.tick_interval.into();

    let mut reactors = HashMap::new();
    let mut receivers = Vec::new();
    for id in &node_ids {
        let mut cfg = ReactorConfig::new(*id);
        cfg.sub_reactor_count = args.sub_reactors;
        cfg.tick_interval = tick;
        cfg.enable_lazy_catch_up = args.lazy_catch_up;
        let (transport, rx) = ChannelTransport::new();
        let reactor = Arc::new(Reactor::new(cfg, Arc::new(transport))?);
        reactor.start();
        reactors.insert(*id, reactor);
        receivers.push(rx);
    }

    let dropped = Arc::new(AtomicU64::new(0));
    for rx in receivers {
        tokio::spawn(route_envelopes(
            rx,
            reactors.clone(),
            dropped.clone(),
            shutdown.clone(),
        ));
    }

    let mut groups = Vec::with_capacity(args.groups);
    for g in 0..args.groups {
        let key = format!("group-{g}");
        let leader = node_ids[g % node_ids.len()];
        for id in &node_ids {
            let mut cfg = ReplicaConfig::new(*id, node_ids.clone());
            cfg.ack_mode = args.ack_mode;
            cfg.replica_max_count = cfg.replica_max_count.max(node_ids.len());
            let mut replica = LogReplica::new(cfg)
                .with_context(|| format!("replica for {key} on node {id}"))?;
            if *id == leader {
                replica.become_leader(1);
            } else {
                replica.become_follower(1, leader);
            }
            reactors[id].add_handler(Handler::new(
                key.clone(),
                replica,
                Arc::new(MemoryStorage::new()),
            ));
        }
        groups.push((key, leader));
    }

    let delivered = Arc::new(AtomicU64::new(0));
    let (ack_tx, ack_rx) = mpsc::unbounded_channel();
    let mut outboxes = HashMap::new();
    for id in &node_ids {
        let forwarder = Arc::new(LoopbackForwarder {
            from: *id,
            delivered: delivered.clone(),
            acks: ack_tx.clone(),
        });
        let outbox = Outbox::new(OutboundConfig::new(*id), forwarder, tick);
        for peer in node_ids.iter().filter(|p| *p != id) {
            outbox.add_replica(*peer);
        }
        outbox.spawn(shutdown.clone());
        outboxes.insert(*id, outbox);
    }
    tokio::spawn(apply_acks(
        ack_rx,
        outboxes.clone(),
        tick,
        shutdown.clone(),
    ));

    Ok(Cluster {
        reactors,
        outboxes,
        groups,
        delivered,
        dropped,
        shutdown,
    })
}

/// Deliver envelopes from one node's transport to their destination.
async fn route_envelopes(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    reactors: HashMap<NodeId, Arc<Reactor>>,
    dropped: Arc<AtomicU64>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            env = rx.recv() => {
                let Some(env) = env else { break };
                match reactors.get(&env.message.to) {
                    Some(reactor) => reactor.add_message(&env.handler_key, env.message),
                    None => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(to = env.message.to, "no route to node");
                    }
                }
            }
            _ = stop.cancelled() => break,
        }
    }
}

/// Feed peer acks back into the sender's outbox and keep every peer
/// heartbeating.
async fn apply_acks(
    mut rx: mpsc::UnboundedReceiver<Ack>,
    outboxes: HashMap<NodeId, Arc<Outbox>>,
    tick: Duration,
    stop: CancellationToken,
) {
    let mut heartbeat = time::interval(tick);
    loop {
        tokio::select! {
            ack = rx.recv() => {
                let Some((from, to, index)) = ack else { break };
                if let Some(outbox) = outboxes.get(&from) {
                    outbox.heartbeat(to);
                    outbox.ack(to, index);
                }
            }
            _ = heartbeat.tick() => {
                for outbox in outboxes.values() {
                    for peer in outbox.replica_ids() {
                        outbox.heartbeat(peer);
                    }
                }
            }
            _ = stop.cancelled() => break,
        }
    }
}

/// Issue batched proposals against random groups until the deadline.
async fn run_client(
    client_id: usize,
    cluster: Arc<Cluster>,
    args: RunArgs,
    seed: u64,
    deadline: time::Instant,
    stop: CancellationToken,
) -> anyhow::Result<ClientReport> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut report = ClientReport::default();
    let op_timeout: Duration = args.op_timeout.into();
    let mut seq = 0u64;

    while time::Instant::now() < deadline && !stop.is_cancelled() {
        let (key, leader) = &cluster.groups[rng.gen_range(0..cluster.groups.len())];
        let mut payloads = HashMap::with_capacity(args.batch);
        let mut entries = Vec::with_capacity(args.batch);
        for _ in 0..args.batch {
            seq += 1;
            let id = ((client_id as u64) << 40) | seq;
            let len = rng.gen_range(args.payload_min..=args.payload_max);
            let mut data = vec![0u8; len];
            rng.fill(&mut data[..]);
            let data = Bytes::from(data);
            payloads.insert(id, data.clone());
            entries.push(LogEntry::new(id, data));
        }

        let started = time::Instant::now();
        let res = cluster.reactors[leader]
            .propose_and_wait(key, entries, op_timeout)
            .await;
        match res {
            Ok(results) => {
                report.ok += 1;
                report.entries += results.len() as u64;
                report
                    .latencies_us
                    .push(started.elapsed().as_micros() as u64);
                let outbox = &cluster.outboxes[leader];
                for result in results {
                    if let Some(payload) = payloads.remove(&result.id) {
                        let uid = format!("user-{}", result.id % 1024);
                        outbox.append(UserMessage::broadcast(result.id, uid, payload));
                    }
                }
            }
            Err(err) => {
                report.failed += 1;
                *report.errors.entry(error_label(&err).to_string()).or_default() += 1;
                tracing::warn!(error = %err, client = client_id, group = %key, "proposal failed");
                if args.fail_fast {
                    anyhow::bail!("client {client_id} proposal on {key} failed: {err}");
                }
            }
        }
    }
    Ok(report)
}

fn error_label(err: &ReactorError) -> &'static str {
    match err {
        ReactorError::Substrate { .. } => "substrate",
        ReactorError::ProposalRejected(_) => "rejected",
        ReactorError::Storage { .. } => "storage",
        ReactorError::HandlerNotFound(_) => "handler_not_found",
        ReactorError::Cancelled => "timeout",
        ReactorError::Stopped => "stopped",
    }
}

/// Wait until every outbox has committed what it appended, or give up.
async fn drain_outboxes(cluster: &Cluster, limit: Duration) {
    let deadline = time::Instant::now() + limit;
    loop {
        let pending: Vec<NodeId> = cluster
            .outboxes
            .iter()
            .filter(|(_, o)| o.commit_index() < o.last_index())
            .map(|(id, _)| *id)
            .collect();
        if pending.is_empty() {
            return;
        }
        if time::Instant::now() >= deadline {
            tracing::warn!(?pending, "outboxes did not drain before the deadline");
            return;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
}

async fn stop_cluster(cluster: &Cluster) {
    cluster.shutdown.cancel();
    for reactor in cluster.reactors.values() {
        reactor.stop().await;
    }
}

fn summarize(args: &RunArgs, seed: u64, cluster: &Cluster, reports: Vec<ClientReport>) -> Summary {
    let mut latencies = Vec::new();
    let mut errors: HashMap<String, u64> = HashMap::new();
    let (mut ok, mut failed, mut entries) = (0, 0, 0);
    for report in reports {
        ok += report.ok;
        failed += report.failed;
        entries += report.entries;
        latencies.extend(report.latencies_us);
        for (label, count) in report.errors {
            *errors.entry(label).or_default() += count;
        }
    }
    latencies.sort_unstable();

    let mut groups: Vec<GroupSummary> = cluster
        .groups
        .iter()
        .filter_map(|(key, leader)| {
            let handler = cluster.reactors[leader].handler(key)?;
            Some(GroupSummary {
                key: key.clone(),
                leader: *leader,
                last_index: handler.last_index(),
                applied_index: handler.applied_index(),
            })
        })
        .collect();
    groups.sort_by(|a, b| a.key.cmp(&b.key));

    let mut outboxes: Vec<OutboxSummary> = cluster
        .outboxes
        .iter()
        .map(|(node, outbox)| OutboxSummary {
            node: *node,
            last_index: outbox.last_index(),
            commit_index: outbox.commit_index(),
        })
        .collect();
    outboxes.sort_by_key(|o| o.node);

    let duration: Duration = args.duration.into();
    Summary {
        meta: SummaryMeta {
            nodes: args.nodes,
            groups: args.groups,
            sub_reactors: args.sub_reactors,
            clients: args.clients,
            batch: args.batch,
            ack_mode: format!("{:?}", args.ack_mode).to_lowercase(),
            duration_ms: duration.as_millis() as u64,
            seed,
        },
        proposals_ok: ok,
        proposals_failed: failed,
        entries_applied: entries,
        errors,
        latency: latency_summary(&latencies),
        forwarded_messages: cluster.delivered.load(Ordering::Relaxed),
        dropped_envelopes: cluster.dropped.load(Ordering::Relaxed),
        groups,
        outboxes,
    }
}

/// Percentiles over sorted samples.
fn latency_summary(sorted: &[u64]) -> LatencySummary {
    let Some(max) = sorted.last().copied() else {
        return LatencySummary::default();
    };
    let pct = |p: f64| {
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    };
    LatencySummary {
        p50_us: pct(0.50),
        p95_us: pct(0.95),
        p99_us: pct(0.99),
        max_us: max,
    }
}

/// Serialize and write the run summary JSON.
fn write_summary(path: &PathBuf, summary: &Summary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        // Ensure the output directory exists before writing.
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(summary).context("serialize summary")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_percentiles_pick_sorted_samples() {
        let samples: Vec<u64> = (1..=100).collect();
        let s = latency_summary(&samples);
        assert_eq!((s.p50_us, s.p95_us, s.p99_us, s.max_us), (51, 95, 99, 100));
        assert_eq!(latency_summary(&[]).max_us, 0);
    }

    #[test]
    fn run_args_parse_ack_mode_and_durations() {
        let args = Args::try_parse_from([
            "relay-workload",
            "run",
            "--ack-mode",
            "all",
            "--duration",
            "2s",
            "--nodes",
            "5",
        ])
        .unwrap();
        let Command::Run(run) = args.cmd;
        assert_eq!(run.ack_mode, AckMode::All);
        assert_eq!(Duration::from(run.duration), Duration::from_secs(2));
        assert_eq!(run.nodes, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn short_run_commits_and_forwards() {
        let dir = std::env::temp_dir().join(format!("relay-workload-{}", std::process::id()));
        let out = dir.join("summary.json");
        let args = Args::try_parse_from([
            "relay-workload",
            "run",
            "--groups",
            "4",
            "--clients",
            "2",
            "--duration",
            "300ms",
            "--seed",
            "7",
            "--out",
            out.to_str().unwrap(),
        ])
        .unwrap();
        let Command::Run(run_args) = args.cmd;
        run(run_args).await.unwrap();

        let summary: Summary = serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
        assert!(summary.proposals_ok > 0);
        assert_eq!(summary.proposals_failed, 0);
        assert!(summary.forwarded_messages > 0);
        assert!(summary.outboxes.iter().all(|o| o.commit_index == o.last_index));
        std::fs::remove_dir_all(dir).ok();
    }
}
