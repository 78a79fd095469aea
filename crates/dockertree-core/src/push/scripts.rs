//! Remote shell scripts executed over SSH during a push.
//!
//! The scripts are opaque to the rest of the pipeline beyond their
//! exit-zero contract.

/// Prepare a fresh server: container runtime, compose plugin, and firewall
/// rules for SSH/HTTP/HTTPS.
pub const SERVER_PREP_SCRIPT: &str = r#"
set -euo pipefail
export DEBIAN_FRONTEND=noninteractive

echo "[prep] detecting package manager" >&2
if command -v apt-get >/dev/null 2>&1; then
  PKG_UPDATE='apt-get -y -qq update'
  PKG_INSTALL='apt-get -y -qq install'
elif command -v dnf >/dev/null 2>&1; then
  PKG_UPDATE='dnf -y makecache'
  PKG_INSTALL='dnf install -y -q'
else
  echo "[prep] unsupported distribution" >&2
  exit 1
fi

if ! command -v docker >/dev/null 2>&1; then
  echo "[prep] installing container runtime" >&2
  $PKG_UPDATE
  $PKG_INSTALL ca-certificates curl
  curl -fsSL https://get.docker.com | sh
fi
docker compose version >/dev/null 2>&1 || $PKG_INSTALL docker-compose-plugin || true

if command -v ufw >/dev/null 2>&1; then
  echo "[prep] configuring firewall" >&2
  ufw allow 22/tcp >/dev/null || true
  ufw allow 80/tcp >/dev/null || true
  ufw allow 443/tcp >/dev/null || true
  yes | ufw enable >/dev/null 2>&1 || true
fi

echo "[prep] done" >&2
"#;

/// Compose the bracketed remote import script: locate the tool, detect
/// normal vs standalone mode, import non-interactively with the override
/// flags, then bring the proxy and the stack up.
#[must_use]
pub fn remote_import_script(
    remote_file: &str,
    branch: &str,
    domain: Option<&str>,
    ip: Option<&str>,
) -> String {
    let override_flags = match (domain, ip) {
        (Some(domain), _) => format!("--domain '{domain}'"),
        (None, Some(ip)) => format!("--ip '{ip}'"),
        (None, None) => String::new(),
    };
    format!(
        r#"
set -euo pipefail
log() {{ echo "[import] $*" >&2; }}

PKG_FILE='{remote_file}'
BRANCH='{branch}'

log "package: $PKG_FILE"
[ -f "$PKG_FILE" ] || {{ log "package file missing"; exit 1; }}

if command -v dockertree >/dev/null 2>&1; then
  DTBIN="$(command -v dockertree)"
elif [ -x /usr/local/bin/dockertree ]; then
  DTBIN=/usr/local/bin/dockertree
else
  log "dockertree binary not found on remote"
  exit 1
fi
log "using $DTBIN"

git config --global user.email >/dev/null 2>&1 || git config --global user.email 'dockertree@local'
git config --global user.name  >/dev/null 2>&1 || git config --global user.name  'dockertree'

HIT="$(find "$HOME" -maxdepth 3 -type f -path '*/.dockertree/config.yml' -print -quit 2>/dev/null || true)"
if [ -n "$HIT" ]; then
  ROOT="$(dirname "$(dirname "$HIT")")"
  log "existing project at $ROOT, normal import"
  cd "$ROOT"
  "$DTBIN" packages import "$PKG_FILE" {override_flags}
else
  ROOT="$HOME/$BRANCH"
  log "no project found, standalone import into $ROOT"
  "$DTBIN" packages import "$PKG_FILE" --standalone --target-dir "$ROOT" {override_flags}
  cd "$ROOT"
fi

log "starting proxy"
"$DTBIN" start-proxy
log "starting stack"
"$DTBIN" "$BRANCH" up -d
log "done"
"#
    )
}

/// Restrict database and cache ingress on a central host to the VPC
/// range.
#[must_use]
pub fn vpc_firewall_script(vpc_cidr: &str) -> String {
    format!(
        r#"
set -euo pipefail
command -v ufw >/dev/null 2>&1 || {{ echo "[vpc] ufw not installed" >&2; exit 0; }}
echo "[vpc] allowing db/cache ingress from {vpc_cidr}" >&2
ufw allow from {vpc_cidr} to any port 5432 proto tcp >/dev/null
ufw allow from {vpc_cidr} to any port 6379 proto tcp >/dev/null
ufw deny 5432/tcp >/dev/null || true
ufw deny 6379/tcp >/dev/null || true
"#
    )
}

/// Script applying a code-only update from an uploaded archive.
#[must_use]
pub fn remote_code_update_script(remote_archive: &str, branch: &str) -> String {
    format!(
        r#"
set -euo pipefail
log() {{ echo "[code] $*" >&2; }}

HIT="$(find "$HOME" -maxdepth 3 -type f -path '*/.dockertree/config.yml' -print -quit 2>/dev/null || true)"
[ -n "$HIT" ] || {{ log "no dockertree project on remote"; exit 1; }}
ROOT="$(dirname "$(dirname "$HIT")")"
log "applying code update in $ROOT"
tar -xf '{remote_archive}' -C "$ROOT"
cd "$ROOT"
if command -v dockertree >/dev/null 2>&1; then
  dockertree '{branch}' restart || true
fi
log "done"
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_script_carries_override_flags() {
        let script = remote_import_script("/root/pkg.tar.gz", "feature-auth", Some("app.example.com"), None);
        assert!(script.contains("--domain 'app.example.com'"));
        assert!(!script.contains("--ip"));

        let script = remote_import_script("/root/pkg.tar.gz", "feature-auth", None, Some("203.0.113.10"));
        assert!(script.contains("--ip '203.0.113.10'"));
    }

    #[test]
    fn import_script_is_bracketed_and_nonempty() {
        let script = remote_import_script("/root/pkg.tar.gz", "feature-auth", None, None);
        assert!(script.contains("set -euo pipefail"));
        assert!(script.contains("start-proxy"));
        assert!(script.contains("up -d"));
    }
}
