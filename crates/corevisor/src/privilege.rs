/// Whether the process runs with administrator or root rights
#[cfg(unix)]
pub fn is_elevated() -> bool {
    nix::unistd::geteuid().is_root()
}

/// `net session` only succeeds from an elevated token
#[cfg(windows)]
pub fn is_elevated() -> bool {
    std::process::Command::new("net")
        .arg("session")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_matches_effective_uid() {
        assert_eq!(is_elevated(), nix::unistd::geteuid().as_raw() == 0);
    }
}
