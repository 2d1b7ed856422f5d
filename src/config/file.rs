use super::StackConfig;

use dirs::config_dir;

use std::fmt::{self, Display};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV_VAR: &str = "KUBESTACK_CONFIG";
const NO_CONFIG_DIR_MESSAGE: &str = "Unable to determine the user's config directory to load kubestack/stack.yaml, set KUBESTACK_CONFIG to the path of the stack config file instead";

/// Error representing a problem with loading a stack config file
#[derive(Debug)]
pub enum StackConfigError {
    Io(io::Error),
    Format(serde_yaml::Error),
    NoConfigDir,
    Invalid(String),
}

impl From<serde_yaml::Error> for StackConfigError {
    fn from(err: serde_yaml::Error) -> StackConfigError {
        StackConfigError::Format(err)
    }
}

impl From<io::Error> for StackConfigError {
    fn from(err: io::Error) -> StackConfigError {
        StackConfigError::Io(err)
    }
}

impl Display for StackConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            StackConfigError::Io(ref e) => write!(f, "IO error: {}", e),
            StackConfigError::Format(ref e) => write!(f, "Stack config format error: {}", e),
            StackConfigError::NoConfigDir => f.write_str(NO_CONFIG_DIR_MESSAGE),
            StackConfigError::Invalid(ref msg) => write!(f, "Invalid stack config: {}", msg),
        }
    }
}

impl std::error::Error for StackConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            StackConfigError::Io(ref e) => Some(e),
            StackConfigError::Format(ref e) => Some(e),
            _ => None,
        }
    }
}

/// Returns the value of `$KUBESTACK_CONFIG` if it's set, otherwise `<config dir>/kubestack/stack.yaml`
pub fn default_config_path() -> Result<PathBuf, StackConfigError> {
    std::env::var(CONFIG_PATH_ENV_VAR)
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            config_dir().map(|mut dir| {
                dir.push("kubestack");
                dir.push("stack.yaml");
                dir
            })
        })
        .ok_or(StackConfigError::NoConfigDir)
}

pub fn load_stack_config(file_path: impl AsRef<Path>) -> Result<StackConfig, StackConfigError> {
    log::debug!("Loading stack config from: '{}'", file_path.as_ref().display());
    let reader = File::open(file_path.as_ref())?;
    let config: StackConfig = serde_yaml::from_reader(reader)?;
    check(config)
}

pub fn load_default_stack_config() -> Result<StackConfig, StackConfigError> {
    let path = default_config_path()?;
    load_stack_config(path)
}

impl StackConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<StackConfig, StackConfigError> {
        let config: StackConfig = serde_yaml::from_str(yaml)?;
        check(config)
    }
}

fn check(config: StackConfig) -> Result<StackConfig, StackConfigError> {
    if config.containers.is_empty() {
        return Err(StackConfigError::Invalid(
            "at least one container must be configured".to_owned(),
        ));
    }
    if config.account_id.is_empty() && config.registry.is_none() {
        return Err(StackConfigError::Invalid(
            "either accountId or registry must be set".to_owned(),
        ));
    }
    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource::spec::ServiceType;
    use crate::stack::StackVariant;

    const MINIMAL: &str = r#"
name: nn-kube
accountId: "123456789012"
region: us-west-1
containers:
  - name: noticeninja-auth
    port: 3001
admins:
  - principal: KubeAdmin
"#;

    #[test]
    fn minimal_config_is_filled_with_defaults() {
        let config = StackConfig::from_yaml_str(MINIMAL).expect("failed to parse config");
        assert_eq!(StackVariant::Initial, config.variant);
        assert_eq!("1.24", config.kubernetes_version);
        assert_eq!(2, config.replicas);
        assert_eq!(2, config.node_pool.desired_size);
        assert_eq!(ServiceType::LoadBalancer, config.service.service_type);
        assert_eq!(80, config.service.port);
        assert_eq!(vec!["system:masters".to_owned()], config.admins[0].groups);
        assert_eq!(
            "123456789012.dkr.ecr.us-west-1.amazonaws.com/noticeninja-auth:latest",
            config.image_for(&config.containers[0])
        );
    }

    #[test]
    fn partial_sections_keep_the_remaining_defaults() {
        let yaml = format!(
            "{}variant: withCache\nnodePool:\n  maxSize: 6\ncache:\n  injectEndpoint: true\nregistry: registry.local\n",
            MINIMAL
        );
        let config = StackConfig::from_yaml_str(&yaml).expect("failed to parse config");
        assert_eq!(StackVariant::WithCache, config.variant);
        assert_eq!(6, config.node_pool.max_size);
        assert_eq!(1, config.node_pool.min_size);
        assert!(config.cache.inject_endpoint);
        assert_eq!(6379, config.cache.port);
        assert_eq!("registry.local/noticeninja-auth:latest", config.image_for(&config.containers[0]));
    }

    #[test]
    fn config_without_containers_is_rejected() {
        let yaml = "name: x\naccountId: '1'\nregion: r\ncontainers: []\n";
        match StackConfig::from_yaml_str(yaml) {
            Err(StackConfigError::Invalid(_)) => {}
            other => panic!("expected Invalid, got: {:?}", other),
        }
    }

    #[test]
    fn config_is_loaded_from_a_file() {
        let mut path = std::env::temp_dir();
        path.push(format!("kubestack-test-{}.yaml", std::process::id()));
        std::fs::write(&path, MINIMAL).expect("failed to write config file");
        let result = load_stack_config(&path);
        let _ = std::fs::remove_file(&path);
        let config = result.expect("failed to load config");
        assert_eq!("nn-kube", config.name);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        match load_stack_config("/definitely/not/a/real/stack.yaml") {
            Err(StackConfigError::Io(_)) => {}
            other => panic!("expected Io error, got: {:?}", other),
        }
    }
}
