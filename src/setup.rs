// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Setup server

use std::{str::FromStr, sync::Arc, time::Duration};

use cluster::manager::ClusterManager;
use common_util::runtime_level::RuntimeLevel;
use coordinator::eventdispatch::dispatch_impl::DispatchImpl;
use etcd_client::ConnectOptions;
use log::{info, warn, LevelFilter};
use meta_storage::{
    kv::{EtcdKv, KvBackendRef},
    meta::MetaStorage,
};
use server::{
    http::{HttpConfig, Service},
    limiter::{FlowLimiter, FlowLimiterView},
    member::Member,
    server::{ServerConfig, ServerInner},
};

use crate::{config::Config, signal_handler};

/// Setup log with given `config`, returns the runtime log level switch.
///
/// The backend filter stays at trace and the effective level is gated by
/// [`RuntimeLevel`], so `/debug/log_level` can change it at runtime.
pub fn setup_logger(config: &Config) -> RuntimeLevel {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(LevelFilter::Trace);

    if !config.log.file.is_empty() {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log.file)
        {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Failed to open log file:{}, err:{e}", config.log.file),
        }
    }

    builder.try_init().expect("Failed to init log.");

    let level = LevelFilter::from_str(&config.log.level).unwrap_or(LevelFilter::Info);
    RuntimeLevel::new(level)
}

/// Run a server, returns when the server is shutdown by user
pub fn run_server(config: Config, log_runtime: RuntimeLevel) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("ceresmeta")
        .enable_all()
        .build()
        .expect("Failed to create runtime");

    info!("Server starts up, config:{:#?}", config);

    runtime.block_on(run_server_inner(config, log_runtime));
}

async fn run_server_inner(config: Config, log_runtime: RuntimeLevel) {
    let config_content = toml::to_string(&config).expect("Fail to serialize config");

    // Connect to the etcd cluster backing every piece of persistent state.
    let connect_options = ConnectOptions::default()
        .with_connect_timeout(Duration::from_millis(config.etcd.etcd_start_timeout_ms))
        .with_timeout(Duration::from_millis(config.etcd.etcd_call_timeout_ms));
    let etcd = tokio::time::timeout(
        Duration::from_millis(config.etcd.etcd_start_timeout_ms),
        etcd_client::Client::connect(&config.etcd.client_urls, Some(connect_options)),
    )
    .await
    .expect("Connecting to etcd timed out")
    .expect("Failed to connect to etcd");

    let kv: KvBackendRef = Arc::new(EtcdKv::new(
        etcd.clone(),
        Duration::from_millis(config.etcd.etcd_call_timeout_ms),
        config.max_scan_limit,
        config.max_ops_per_txn,
    ));
    let meta_storage = Arc::new(
        MetaStorage::new(kv.clone(), config.storage_root_path.clone())
            .expect("Failed to build meta storage"),
    );

    let cluster_manager = Arc::new(
        ClusterManager::new(meta_storage.clone(), config.id_allocator_step)
            .await
            .expect("Failed to build cluster manager"),
    );

    let election_lease_sec = ((config.election_timeout_ms / 1000) as i64).max(1);
    let member = Arc::new(Member::new(
        etcd.clone(),
        &config.storage_root_path,
        config.advertise_addr(),
        election_lease_sec,
    ));

    let limiter = FlowLimiter::new(FlowLimiterView {
        enable: config.flow_limiter.enable,
        limit: config.flow_limiter.limit,
        burst: config.flow_limiter.burst,
    });

    let server_config = ServerConfig {
        storage_root_path: config.storage_root_path.clone(),
        id_allocator_step: config.id_allocator_step,
        scheduler_tick_interval: Duration::from_millis(config.tick_interval_ms),
        enable_schedule: config.enable_schedule,
        default_cluster_name: config.default_cluster_name.clone(),
        default_cluster_node_count: config.default_cluster_node_count,
        default_cluster_shard_total: config.default_cluster_shard_total,
        topology_type: config.topology_type,
        procedure_executing_batch_size: config.procedure_executing_batch_size,
    };
    let inner = Arc::new(ServerInner::new(
        server_config,
        cluster_manager,
        member.clone(),
        limiter,
        Arc::new(DispatchImpl::default()),
        meta_storage,
        kv,
        Some(etcd),
    ));

    // Followers serve the read only endpoints from this initial load; the
    // leader reloads on election.
    if let Err(e) = inner.cluster_manager.load().await {
        warn!("Failed to load clusters at startup, err:{e}");
    }

    member.clone().start();
    let leadership_handle = inner.clone().spawn_leadership_loop();

    let mut http_service = Service::new(
        HttpConfig {
            addr: config.addr.clone(),
            port: config.http_port,
            max_body_size: config.max_request_bytes,
        },
        inner.clone(),
        Arc::new(log_runtime),
        config_content,
    );
    http_service
        .start()
        .await
        .expect("Failed to start http service");

    info!("Server has started");

    // Wait for signal
    signal_handler::wait_for_signal();

    // Stop server
    http_service.stop();
    inner.stop_coordinators().await;
    member.stop().await;
    leadership_handle.abort();

    info!("Server has stopped");
}
