use jiff::Timestamp;
use russh::server::Msg;
use russh::Channel;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::{error, info};

use crate::docker::{bind_mount, RunImageOptions};
use crate::stager;
use crate::types::AppState;

/// Image carrying the embedded SFTP server (the `soj-sftpd` binary).
const SFTP_IMAGE: &str = "soj-subsystem-sftp";
const SFTP_HOSTNAME: &str = "soj-sftpd";
const SFTP_PORT: u16 = 2207;
const SFTP_STOP_TIMEOUT: i64 = 120;

/// Grace for the in-container server to start listening before we dial.
const SFTP_DIAL_DELAY: Duration = Duration::from_millis(200);

/// Serves one SFTP subsystem request: a disposable containerized SFTP
/// server with the user's inbox mounted at `/work`, bridged to the SSH
/// channel over TCP. The handler returns when either side hangs up.
pub async fn tunnel(state: AppState, user: String, channel: Channel<Msg>) {
    let name = format!(
        "soj-subsystem-sftp-{}-{}",
        user,
        Timestamp::now().strftime("%Y%m%d%H%M%S")
    );
    let inbox = state.config.user_inbox(&user);
    info!(%user, %name, inbox = %inbox.display(), "New SFTP session");

    let (uid, gid) = (state.config.submit_uid, state.config.submit_gid);
    let prepared = {
        let inbox = inbox.clone();
        tokio::task::spawn_blocking(move || stager::ensure_owned_dir(&inbox, uid, gid)).await
    };
    match prepared {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(%user, error = %e, "Could not prepare SFTP inbox");
            return;
        }
        Err(e) => {
            error!(%user, error = %e, "Inbox preparation task died");
            return;
        }
    }

    // The engine mounts host paths, which differ from our local view when
    // the judge itself runs containerized.
    let host_inbox: PathBuf = state.config.real_submits_dir().join(&user);

    let container = state
        .docker
        .run_image(RunImageOptions {
            name: name.clone(),
            image: SFTP_IMAGE.to_string(),
            user: uid.to_string(),
            hostname: SFTP_HOSTNAME.to_string(),
            workdir: "/".to_string(),
            env: Vec::new(),
            mounts: vec![bind_mount(
                host_inbox.to_string_lossy().into_owned(),
                "/work".to_string(),
                false,
            )],
            mask_paths: true,
            readonly_rootfs: true,
            disable_network: false,
            network_host_mode: false,
            stop_timeout: SFTP_STOP_TIMEOUT,
        })
        .await;
    let container = match container {
        Ok(container) => container,
        Err(e) => {
            error!(%user, %name, error = %e, "Could not run SFTP container");
            return;
        }
    };

    tokio::time::sleep(SFTP_DIAL_DELAY).await;

    let bridged = bridge(&state, &container, channel).await;
    if let Err(e) = bridged {
        error!(%user, container = %container, error = %e, "SFTP bridge failed");
    }

    state.docker.clean_container(&container).await;
    info!(%user, container = %container, "SFTP session closed");
}

async fn bridge(
    state: &AppState,
    container: &str,
    channel: Channel<Msg>,
) -> Result<(), std::io::Error> {
    let ip = state
        .docker
        .container_ip(container)
        .await
        .map_err(std::io::Error::other)?;

    let mut tcp = TcpStream::connect((ip.as_str(), SFTP_PORT)).await?;
    let mut session = channel.into_stream();

    // Both directions are pumped until EOF; shutdown propagates each way.
    copy_bidirectional(&mut session, &mut tcp).await?;
    Ok(())
}
