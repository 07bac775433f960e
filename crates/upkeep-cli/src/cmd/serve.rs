use anyhow::Context;
use std::path::Path;
use upkeep_server::state::AppState;

/// `--serve`: host the admin API on localhost. Updates and restores started
/// through it run as detached invocations of this same binary.
pub fn run(root: &Path, port: u16) -> anyhow::Result<()> {
    let launcher = std::env::current_exe().context("cannot locate the upkeep binary")?;
    let rt = tokio::runtime::Runtime::new()?;
    let root_buf = root.to_path_buf();

    rt.block_on(async move {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("cannot bind 127.0.0.1:{port}"))?;
        let actual_port = listener.local_addr()?.port();
        println!(
            "upkeep admin API for {} on http://127.0.0.1:{actual_port}  (PID {})",
            root_buf.display(),
            std::process::id()
        );

        let state = AppState::new(root_buf, launcher);
        tokio::select! {
            res = upkeep_server::serve_on(state, listener) => res,
            _ = tokio::signal::ctrl_c() => Ok(()),
        }
    })
}
