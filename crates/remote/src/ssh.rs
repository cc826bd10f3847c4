use std::borrow::Cow;
use std::path::PathBuf;

/// Connection settings for the remote-shell wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    /// Path to the ssh binary.
    pub ssh: String,
    pub user: String,
    /// `ControlPersist` seconds; 0 disables connection multiplexing.
    pub persist_secs: u64,
    /// Directory holding the multiplexing control sockets.
    pub persist_dir: PathBuf,
    /// Extra arguments inserted before `user@host` (identity files etc).
    pub extra_args: Vec<String>,
    /// Keep ssh diagnostics visible (no `-q`).
    pub debug: bool,
}

const QUIET_FLAG: &str = "-q";

/// Build `ssh [-q] -t -o ... user@hostname`.
pub fn ssh_command(opts: &SshOptions, hostname: &str) -> Vec<String> {
    let mut argv = vec![opts.ssh.clone()];
    if !opts.debug {
        argv.push(QUIET_FLAG.to_string());
    }
    argv.push("-t".to_string());

    for option in [
        "ConnectTimeout=1",
        "ConnectionAttempts=1",
        "StrictHostKeyChecking=no",
        "UserKnownHostsFile=/dev/null",
    ] {
        argv.push("-o".to_string());
        argv.push(option.to_string());
    }

    if opts.persist_secs > 0 {
        argv.push("-o".to_string());
        argv.push("ControlMaster=auto".to_string());
        argv.push("-o".to_string());
        argv.push(format!(
            "ControlPath={}/ssh-%r@%h:%p",
            opts.persist_dir.display()
        ));
        argv.push("-o".to_string());
        argv.push(format!("ControlPersist={}", opts.persist_secs));
    }

    argv.extend(opts.extra_args.iter().cloned());
    argv.push(format!("{}@{}", opts.user, hostname));
    argv
}

/// Drop the quiet flag so ssh reports connection errors.
pub fn strip_quiet(mut argv: Vec<String>) -> Vec<String> {
    if let Some(pos) = argv.iter().position(|arg| arg == QUIET_FLAG) {
        argv.remove(pos);
    }
    argv
}

/// `ffmpeg -version` on the remote side, with ssh errors left visible.
pub fn probe_command(opts: &SshOptions, ffmpeg: &str, hostname: &str) -> Vec<String> {
    let mut argv = strip_quiet(ssh_command(opts, hostname));
    argv.push(quote_arg(ffmpeg).into_owned());
    argv.push("-version".to_string());
    argv
}

/// Escape one word for the POSIX shell that sshd runs the command through.
///
/// Words made only of shell-safe characters come back borrowed and
/// unchanged; anything else is single-quoted, so the remote side sees the
/// exact bytes the caller passed.
pub fn quote_arg(arg: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(arg))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(persist_secs: u64, debug: bool) -> SshOptions {
        SshOptions {
            ssh: "/usr/bin/ssh".to_string(),
            user: "jellyfin".to_string(),
            persist_secs,
            persist_dir: PathBuf::from("/run/shm"),
            extra_args: vec!["-i".to_string(), "/keys/id_ed25519".to_string()],
            debug,
        }
    }

    #[test]
    fn test_ssh_command_with_persistence() {
        let argv = ssh_command(&options(300, false), "10.0.0.5");
        assert_eq!(
            argv,
            vec![
                "/usr/bin/ssh",
                "-q",
                "-t",
                "-o",
                "ConnectTimeout=1",
                "-o",
                "ConnectionAttempts=1",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "ControlMaster=auto",
                "-o",
                "ControlPath=/run/shm/ssh-%r@%h:%p",
                "-o",
                "ControlPersist=300",
                "-i",
                "/keys/id_ed25519",
                "jellyfin@10.0.0.5",
            ]
        );
    }

    #[test]
    fn test_ssh_command_without_persistence_or_quiet() {
        let argv = ssh_command(&options(0, true), "worker");
        assert!(!argv.iter().any(|a| a == "-q"));
        assert!(!argv.iter().any(|a| a.starts_with("Control")));
        assert_eq!(argv.last().map(String::as_str), Some("jellyfin@worker"));
    }

    #[test]
    fn test_probe_command_is_verbose() {
        let argv = probe_command(&options(300, false), "/usr/lib/jellyfin-ffmpeg/ffmpeg", "w1");
        assert!(!argv.iter().any(|a| a == "-q"));
        let tail: Vec<_> = argv.iter().rev().take(3).rev().cloned().collect();
        assert_eq!(
            tail,
            vec!["jellyfin@w1", "/usr/lib/jellyfin-ffmpeg/ffmpeg", "-version"]
        );
    }

    #[test]
    fn test_strip_quiet_only_removes_flag() {
        let argv = strip_quiet(vec!["ssh".into(), "-q".into(), "-t".into()]);
        assert_eq!(argv, vec!["ssh", "-t"]);
        let argv = strip_quiet(vec!["ssh".into(), "-t".into()]);
        assert_eq!(argv, vec!["ssh", "-t"]);
    }

    #[test]
    fn test_quote_arg() {
        assert_eq!(quote_arg("-i"), "-i");
        assert_eq!(quote_arg("/media/movie.mkv"), "/media/movie.mkv");
        assert_eq!(quote_arg("/media/My Movie.mkv"), "'/media/My Movie.mkv'");
        assert_eq!(quote_arg("scale=1280:-2,fps=(30)"), "'scale=1280:-2,fps=(30)'");
        assert_eq!(quote_arg("it's"), r"'it'\''s'");
        assert_eq!(quote_arg("*.ts"), "'*.ts'");
        assert_eq!(quote_arg(""), "''");
    }
}
