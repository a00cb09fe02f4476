//! `a3s-ctr run` command: pull if needed, create, start.

use std::collections::HashMap;

use a3s_ctr_core::config::RuntimeConfig;
use a3s_ctr_core::error::{CtrError, Result};
use a3s_ctr_core::network::{NetworkMode, PortMapping};
use a3s_ctr_core::volume::VolumeBinding;
use a3s_ctr_runtime::{IdMapping, RunOutcome, RunSpec, UserNamespaceConfig};
use clap::Args;

use super::open_manager;

#[derive(Args)]
pub struct RunArgs {
    /// Image reference
    pub image: String,

    /// Command and arguments (default: the image's entrypoint and cmd)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,

    /// Run in the background and print the container ID
    #[arg(short = 'd', long)]
    pub detach: bool,

    /// Assign a name to the container
    #[arg(long)]
    pub name: Option<String>,

    /// Container hostname (default: the short ID)
    #[arg(long)]
    pub hostname: Option<String>,

    /// Environment variable (KEY=VALUE, or KEY to copy from the host), can be repeated
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,

    /// Bind a host path or named volume (SRC:DST[:ro]), can be repeated
    #[arg(short = 'v', long = "volume")]
    pub volumes: Vec<String>,

    /// Publish a port ([IP:]HOST:CONTAINER[/PROTO]), can be repeated
    #[arg(short = 'p', long = "publish")]
    pub publish: Vec<String>,

    /// Network mode: bridge, host or none
    #[arg(long, default_value = "bridge")]
    pub network: String,

    /// Memory limit (e.g., "512m", "2g")
    #[arg(short = 'm', long, default_value = "")]
    pub memory: String,

    /// CPU weight in CPUs (e.g., "1.5")
    #[arg(long, default_value = "")]
    pub cpus: String,

    /// Working directory inside the container
    #[arg(short = 'w', long)]
    pub workdir: Option<String>,

    /// Run in a user namespace with the current user mapped to itself
    #[arg(long)]
    pub userns: bool,

    /// UID mapping (CONTAINER:HOST:SIZE), can be repeated; implies --userns
    #[arg(long = "uidmap")]
    pub uid_maps: Vec<String>,

    /// GID mapping (CONTAINER:HOST:SIZE), can be repeated; implies --userns
    #[arg(long = "gidmap")]
    pub gid_maps: Vec<String>,
}

pub async fn execute(args: RunArgs, config: &RuntimeConfig) -> Result<i32> {
    let spec = build_spec(args)?;
    let manager = open_manager(config)?;

    match manager.run(spec).await? {
        RunOutcome::Detached { id, .. } => {
            println!("{id}");
            Ok(0)
        }
        RunOutcome::Exited { exit_code, .. } => Ok(exit_code),
    }
}

fn build_spec(args: RunArgs) -> Result<RunSpec> {
    let volumes = args
        .volumes
        .iter()
        .map(|v| v.parse::<VolumeBinding>())
        .collect::<Result<Vec<_>>>()?;
    let ports = args
        .publish
        .iter()
        .map(|p| p.parse::<PortMapping>())
        .collect::<Result<Vec<_>>>()?;

    Ok(RunSpec {
        image: args.image,
        name: args.name,
        hostname: args.hostname,
        command: args.command,
        env: parse_env_vars(&args.env, |key| std::env::var(key).ok())?,
        volumes,
        ports,
        network: args.network.parse::<NetworkMode>()?,
        memory: args.memory,
        cpus: args.cpus,
        work_dir: args.workdir,
        detached: args.detach,
        user_ns: user_namespace(args.userns, &args.uid_maps, &args.gid_maps)?,
    })
}

/// `KEY=VALUE` pairs; a bare `KEY` takes the host value and is skipped when
/// unset.
fn parse_env_vars(
    vars: &[String],
    host: impl Fn(&str) -> Option<String>,
) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for var in vars {
        match var.split_once('=') {
            Some(("", _)) => {
                return Err(CtrError::Validation(format!(
                    "invalid environment variable (empty key): {var}"
                )))
            }
            Some((key, value)) => {
                map.insert(key.to_string(), value.to_string());
            }
            None => {
                if let Some(value) = host(var) {
                    map.insert(var.clone(), value);
                }
            }
        }
    }
    Ok(map)
}

fn user_namespace(
    enabled: bool,
    uid_maps: &[String],
    gid_maps: &[String],
) -> Result<Option<UserNamespaceConfig>> {
    if uid_maps.is_empty() && gid_maps.is_empty() {
        return Ok(enabled.then(UserNamespaceConfig::rootless));
    }
    if uid_maps.is_empty() || gid_maps.is_empty() {
        return Err(CtrError::Validation(
            "--uidmap and --gidmap must be given together".to_string(),
        ));
    }
    let parse = |maps: &[String]| {
        maps.iter()
            .map(|m| m.parse::<IdMapping>())
            .collect::<Result<Vec<_>>>()
    };
    Ok(Some(UserNamespaceConfig {
        uid_mappings: parse(uid_maps)?,
        gid_mappings: parse(gid_maps)?,
        no_new_privs: true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_host(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_parse_env_vars() {
        let vars = vec!["A=1".to_string(), "B=x=y".to_string(), "C=".to_string()];
        let map = parse_env_vars(&vars, no_host).unwrap();
        assert_eq!(map["A"], "1");
        assert_eq!(map["B"], "x=y");
        assert_eq!(map["C"], "");
    }

    #[test]
    fn test_parse_env_vars_from_host() {
        let vars = vec!["HOME".to_string(), "MISSING".to_string()];
        let map = parse_env_vars(&vars, |k| (k == "HOME").then(|| "/root".to_string())).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["HOME"], "/root");
    }

    #[test]
    fn test_parse_env_vars_empty_key() {
        let err = parse_env_vars(&["=1".to_string()], no_host).unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_user_namespace_flags() {
        assert!(user_namespace(false, &[], &[]).unwrap().is_none());
        assert!(user_namespace(true, &[], &[]).unwrap().is_some());

        let config = user_namespace(false, &["0:1000:1".to_string()], &["0:1000:1".to_string()])
            .unwrap()
            .unwrap();
        assert_eq!(config.uid_mappings, vec![IdMapping::new(0, 1000, 1)]);
        assert!(config.no_new_privs);

        assert!(user_namespace(false, &["0:1000:1".to_string()], &[]).is_err());
        assert!(user_namespace(false, &["bad".to_string()], &["0:0:1".to_string()]).is_err());
    }

    #[test]
    fn test_build_spec_rejects_bad_network() {
        let args = RunArgs {
            image: "alpine".to_string(),
            command: vec![],
            detach: false,
            name: None,
            hostname: None,
            env: vec![],
            volumes: vec!["/data:/data:ro".to_string()],
            publish: vec!["8080:80".to_string()],
            network: "overlay".to_string(),
            memory: String::new(),
            cpus: String::new(),
            workdir: None,
            userns: false,
            uid_maps: vec![],
            gid_maps: vec![],
        };
        assert!(build_spec(args).is_err());
    }
}
