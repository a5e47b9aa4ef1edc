//! The external composite process (ffmpeg). We generate its SDP, point its
//! output at a log file, and manage shutdown with SIGINT escalating to
//! SIGKILL. Media never passes through this process' parent.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

pub const SIGINT_GRACE: Duration = Duration::from_secs(5);

/// Single-pass composite filter: primary scaled to the full frame, pip at
/// 25% overlaid bottom-right with a 40 px margin. One video input is a
/// plain scale.
pub fn filter_graph(video_inputs: usize, layout: &str) -> Option<String> {
    match video_inputs {
        0 => None,
        1 => Some("[0:v]scale=1280:720:force_original_aspect_ratio=decrease,pad=1280:720:(ow-iw)/2:(oh-ih)/2[vout]".to_string()),
        _ if layout == "pip" => Some(
            "[0:v]scale=1280:720:force_original_aspect_ratio=decrease,pad=1280:720:(ow-iw)/2:(oh-ih)/2[main];\
             [1:v]scale=iw*0.25:ih*0.25[pip];\
             [main][pip]overlay=W-w-40:H-h-40[vout]"
                .to_string(),
        ),
        // Unknown layouts fall back to the primary stream alone.
        _ => Some("[0:v]scale=1280:720:force_original_aspect_ratio=decrease,pad=1280:720:(ow-iw)/2:(oh-ih)/2[vout]".to_string()),
    }
}

pub struct CompositorSpec {
    pub ffmpeg_path: String,
    pub sdp_path: PathBuf,
    pub output_path: PathBuf,
    pub log_path: PathBuf,
    pub video_inputs: usize,
    pub layout: String,
}

pub fn build_args(spec: &CompositorSpec) -> Vec<String> {
    let mut args = vec![
        "-nostdin".to_string(),
        "-loglevel".to_string(),
        "info".to_string(),
        "-protocol_whitelist".to_string(),
        "file,udp,rtp".to_string(),
        "-i".to_string(),
        spec.sdp_path.display().to_string(),
    ];

    if let Some(filter) = filter_graph(spec.video_inputs, &spec.layout) {
        args.extend([
            "-filter_complex".to_string(),
            filter,
            "-map".to_string(),
            "[vout]".to_string(),
            "-map".to_string(),
            "0:a?".to_string(),
        ]);
    } else {
        args.extend(["-map".to_string(), "0:a?".to_string()]);
    }

    args.extend([
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "veryfast".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        "-y".to_string(),
        spec.output_path.display().to_string(),
    ]);
    args
}

pub struct CompositorHandle {
    pid: i32,
}

impl CompositorHandle {
    /// Spawns ffmpeg with stdout/stderr appended to the log file, and a
    /// monitor task that reports the exit status through `on_exit`.
    pub async fn spawn(
        spec: &CompositorSpec,
        on_exit: impl FnOnce(std::process::ExitStatus) + Send + 'static,
    ) -> std::io::Result<Self> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)?;
        let log_err = log.try_clone()?;

        let mut child = Command::new(&spec.ffmpeg_path)
            .args(build_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()?;

        let pid = child.id().map(|p| p as i32).ok_or_else(|| {
            std::io::Error::other("compositor exited before pid was observed")
        })?;
        info!(pid, ffmpeg = %spec.ffmpeg_path, "compositor started");

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => on_exit(status),
                Err(e) => {
                    warn!(%e, "compositor wait failed");
                    use std::os::unix::process::ExitStatusExt;
                    on_exit(std::process::ExitStatus::from_raw(1));
                }
            }
        });

        Ok(Self { pid })
    }

    pub fn signal_int(&self) {
        if let Err(e) = kill(Pid::from_raw(self.pid), Signal::SIGINT) {
            warn!(pid = self.pid, %e, "SIGINT delivery failed");
        }
    }

    pub fn signal_kill(&self) {
        if let Err(e) = kill(Pid::from_raw(self.pid), Signal::SIGKILL) {
            warn!(pid = self.pid, %e, "SIGKILL delivery failed");
        }
    }
}

pub fn session_paths(tmp_dir: &Path, session_id: &str) -> (PathBuf, PathBuf, PathBuf) {
    (
        tmp_dir.join(format!("{session_id}.sdp")),
        tmp_dir.join(format!("{session_id}.mp4")),
        tmp_dir.join(format!("{session_id}.log")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_video_has_no_overlay() {
        let filter = filter_graph(1, "pip").unwrap();
        assert!(!filter.contains("overlay"));
    }

    #[test]
    fn pip_layout_overlays_bottom_right_with_margin() {
        let filter = filter_graph(2, "pip").unwrap();
        assert!(filter.contains("overlay=W-w-40:H-h-40"));
        assert!(filter.contains("scale=iw*0.25:ih*0.25"));
    }

    #[test]
    fn no_video_means_no_filter() {
        assert!(filter_graph(0, "pip").is_none());
    }

    #[tokio::test]
    async fn monitor_reports_child_exit() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CompositorSpec {
            // Any short-lived binary exercises spawn + monitor.
            ffmpeg_path: "/bin/true".into(),
            sdp_path: dir.path().join("s.sdp"),
            output_path: dir.path().join("s.mp4"),
            log_path: dir.path().join("s.log"),
            video_inputs: 0,
            layout: "pip".into(),
        };

        let (tx, rx) = tokio::sync::oneshot::channel();
        let _handle = CompositorHandle::spawn(&spec, move |status| {
            let _ = tx.send(status);
        })
        .await
        .unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("monitor fired")
            .unwrap();
        assert!(status.success());
        assert!(spec.log_path.exists());
    }

    #[test]
    fn args_reference_sdp_and_output() {
        let spec = CompositorSpec {
            ffmpeg_path: "ffmpeg".into(),
            sdp_path: "/tmp/r/abc.sdp".into(),
            output_path: "/tmp/r/abc.mp4".into(),
            log_path: "/tmp/r/abc.log".into(),
            video_inputs: 2,
            layout: "pip".into(),
        };
        let args = build_args(&spec);
        assert!(args.contains(&"/tmp/r/abc.sdp".to_string()));
        assert!(args.contains(&"/tmp/r/abc.mp4".to_string()));
        assert!(args.contains(&"-filter_complex".to_string()));
    }
}
