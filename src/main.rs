// === Jemalloc 全局分配器配置（用于内存分析）===
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod config;
pub mod credential;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod logging;
pub mod quota_pool;
pub mod runtime_config;
pub mod upstream;
pub mod usage;
pub mod util;

use anyhow::Context;
use axum::routing::{get, post};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing(&cfg);

    let runtime = Arc::new(runtime_config::RuntimeConfig::from_config(&cfg));

    let store = Arc::new(credential::store::Store::new(&cfg.data_dir));
    let credentials = match store.load().await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("加载 credentials.json 失败: {e:#}");
            Vec::new()
        }
    };
    let registry = Arc::new(quota_pool::KeyRegistry::from_credentials(credentials).await);
    tracing::info!(
        "已加载 {} 个 Key（{} 个启用）",
        registry.len().await,
        registry.list_enabled().await.len()
    );

    // 后台定期清理滑动窗口中的过期记录，空闲 Key 也不会无限占用内存。
    quota_pool::spawn_purge_task(registry.clone(), cfg.purge_interval());

    let usage_store = usage::store::open(cfg.usage_store, &cfg.data_dir)
        .await
        .context("初始化用量存储失败")?;
    let usage = Arc::new(usage::UsageReporter::new(
        registry.clone(),
        usage_store,
        cfg.cost_cache_ttl(),
    ));

    let executor = Arc::new(executor::RequestExecutor::new(
        registry.clone(),
        usage.clone(),
        runtime.clone(),
    ));
    let upstream = upstream::UpstreamClient::new(&cfg, runtime.clone())
        .context("初始化上游客户端失败")?;

    let proxy_state = Arc::new(gateway::proxy::ProxyState {
        executor,
        upstream,
        runtime: runtime.clone(),
        provider: cfg.upstream_provider.clone(),
    });

    let manager_state = Arc::new(gateway::manager::ManagerState {
        registry: registry.clone(),
        store: store.clone(),
        usage: usage.clone(),
        runtime: runtime.clone(),
    });

    // === 公开路由（不需要认证）===
    let public_routes = Router::new()
        .route("/health", get(handle_health))
        .route("/debug/pprof/heap", get(handle_pprof_heap));

    // === API 路由 ===
    let api_routes = Router::new()
        .route(
            "/v1/chat/completions",
            post(gateway::proxy::handle_chat_completions),
        )
        // 允许尾随斜杠的同一路径
        .route(
            "/v1/chat/completions/",
            post(gateway::proxy::handle_chat_completions),
        )
        .with_state(proxy_state);

    // === Manager API 路由（需要认证）===
    let manager_api_routes = Router::new()
        .route("/manager/api/stats", get(gateway::manager::handle_stats))
        .route("/manager/api/keys/{id}", get(gateway::manager::handle_key))
        .route("/manager/api/toggle", post(gateway::manager::handle_toggle))
        .route("/manager/api/add", post(gateway::manager::handle_add))
        .route("/manager/api/delete", post(gateway::manager::handle_delete))
        .route("/manager/api/reload", post(gateway::manager::handle_reload))
        .route(
            "/manager/api/settings",
            get(gateway::manager::handle_settings_get).post(gateway::manager::handle_settings_post),
        )
        .route("/manager/api/cost", get(gateway::manager::handle_cost))
        .layer(middleware::from_fn_with_state(
            manager_state.clone(),
            gateway::manager::manager_auth_middleware,
        ))
        .with_state(manager_state);

    // 组合所有路由
    let app = Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .merge(manager_api_routes);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

async fn handle_health() -> &'static str {
    "ok"
}

fn init_tracing(cfg: &config::Config) {
    // DEBUG=off 关闭全部日志；其余情况下依赖库默认 warn，本项目至少 info，
    // 以免环境中预设的 RUST_LOG=warn 把选择/轮换日志过滤掉。
    let debug = cfg.debug.trim().to_lowercase();
    let filter = if debug == "off" {
        EnvFilter::new("off")
    } else {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,keyrelay=info")
        } else if env.contains("keyrelay") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},keyrelay=info"))
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}

/// 导出 jemalloc 堆内存分析数据（pprof 格式）
/// 使用方式：
/// 1. curl http://localhost:PORT/debug/pprof/heap > heap.pb.gz
/// 2. go tool pprof -http=:8080 heap.pb.gz
#[cfg(not(target_env = "msvc"))]
async fn handle_pprof_heap() -> axum::response::Response {
    use axum::http::{StatusCode, header};
    use axum::response::IntoResponse;

    let Some(prof_ctl) = jemalloc_pprof::PROF_CTL.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "jemalloc profiling not enabled. Set MALLOC_CONF=prof:true before starting.",
        )
            .into_response();
    };

    let mut prof = prof_ctl.lock().await;
    match prof.dump_pprof() {
        Ok(pprof_data) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"heap.pb.gz\""),
            ],
            pprof_data,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to dump pprof: {e}"),
        )
            .into_response(),
    }
}

#[cfg(target_env = "msvc")]
async fn handle_pprof_heap() -> &'static str {
    "jemalloc profiling is not supported on MSVC targets"
}
