#[tokio::main]
async fn main() -> control_plane::Result<()> {
    control_plane::init_tracing();
    tracing::info!(
        version = control_plane::version::VERSION,
        git_sha = control_plane::version::GIT_SHA,
        built_at = control_plane::version::BUILD_TIMESTAMP,
        "control-plane starting"
    );
    control_plane::run().await
}
