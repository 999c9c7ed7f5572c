//! Pre-queue validation of assembled [proto::QueuedOperation]s.
//!
//! Violations are collected, not short-circuited, so a caller receives the
//! complete list of problems in one round trip.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use quern_reapi::{blob_name, proto};

use crate::backplane::Backplane;
use crate::config::SchedulerConfig;
use crate::errors::Error;
use crate::resolver::Resolver;

pub const VIOLATION_TYPE_MISSING: &str = "MISSING";
pub const VIOLATION_TYPE_INVALID: &str = "INVALID";

const MISSING_INPUT: &str =
    "A requested input (or the `Action` or its `Command`) was not found in the CAS.";
const DUPLICATE_DIRENT: &str = "An input `Directory` has a duplicate entry.";
const DIRECTORY_NOT_SORTED: &str = "An input `Directory` is not sorted.";
const DIRECTORY_CYCLE_DETECTED: &str =
    "The input file tree contains a cycle (a `Directory` which contains itself, directly or indirectly).";
const DUPLICATE_ENVIRONMENT_VARIABLE: &str =
    "The `Command` has a duplicate environment variable.";
const ENVIRONMENT_VARIABLES_NOT_SORTED: &str =
    "The `Command` environment variables are not sorted.";
const DUPLICATE_OUTPUT_PATH: &str = "The `Command` has a duplicate output path.";
const OUTPUT_PATHS_NOT_SORTED: &str = "The `Command` output paths are not sorted.";
const TIMEOUT_OUT_OF_BOUNDS: &str = "The `Action` timeout exceeds the configured maximum.";
const INVALID_CORES_PROPERTY: &str = "The platform cores property is not a valid count.";
const CORES_OUT_OF_BOUNDS: &str = "The platform cores range is out of bounds.";
const PLATFORM_NOT_ELIGIBLE: &str = "No queue accepts the requested platform properties.";

/// Accumulated precondition violations.
#[derive(Debug, Default)]
pub struct Violations(Vec<proto::rpc::precondition_failure::Violation>);

impl Violations {
    fn add(&mut self, r#type: &str, subject: String, description: &str) {
        self.0.push(proto::rpc::precondition_failure::Violation {
            r#type: r#type.to_string(),
            subject,
            description: description.to_string(),
        });
    }

    fn invalid(&mut self, subject: String, description: &str) {
        self.add(VIOLATION_TYPE_INVALID, subject, description);
    }

    pub fn missing(&mut self, digest: &proto::Digest) {
        self.add(VIOLATION_TYPE_MISSING, blob_name(digest), MISSING_INPUT);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_result(self) -> Result<(), Error> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(Error::ViolatesPrecondition(proto::rpc::PreconditionFailure {
                violations: self.0,
            }))
        }
    }
}

pub struct Validator {
    backplane: Arc<dyn Backplane>,
    resolver: Arc<Resolver>,
    max_action_timeout: Duration,
    max_cores: i32,
}

impl Validator {
    pub fn new(
        backplane: Arc<dyn Backplane>,
        resolver: Arc<Resolver>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            backplane,
            resolver,
            max_action_timeout: Duration::from_secs(config.max_action_timeout_secs.max(0) as u64),
            max_cores: config.max_cores,
        }
    }

    #[instrument(skip_all)]
    pub async fn validate(
        &self,
        queued: &proto::QueuedOperation,
        metadata: &proto::RequestMetadata,
    ) -> Result<(), Error> {
        let mut violations = Violations::default();

        let Some(action) = &queued.action else {
            violations.missing(&proto::Digest::default());
            return violations.into_result();
        };
        validate_action(action, self.max_action_timeout, &mut violations);

        match &queued.command {
            Some(command) => {
                validate_command(command, self.max_cores, &mut violations);
                if let Some(platform) = &command.platform {
                    if !self
                        .backplane
                        .properties_eligible_for_queue(&platform.properties)
                        .await?
                    {
                        violations.invalid("platform".to_string(), PLATFORM_NOT_ELIGIBLE);
                    }
                }
            }
            None => violations.missing(action.command_digest.as_ref().unwrap_or(&Default::default())),
        }

        match &queued.tree {
            Some(tree) => {
                validate_tree(tree, &mut violations);
                for missing in self
                    .resolver
                    .find_missing_blobs(file_digests(tree), metadata)
                    .await?
                {
                    violations.missing(&missing);
                }
            }
            None => {
                violations.missing(action.input_root_digest.as_ref().unwrap_or(&Default::default()))
            }
        }

        violations.into_result()
    }
}

/// Every file blob the tree references, deduplicated.
fn file_digests(tree: &proto::Tree) -> Vec<proto::Digest> {
    let mut seen = HashSet::new();
    for directory in tree.directories.values() {
        for file in &directory.files {
            if let Some(digest) = &file.digest {
                seen.insert(digest.clone());
            }
        }
    }
    seen.into_iter().collect()
}

pub(crate) fn validate_action(
    action: &proto::Action,
    max_timeout: Duration,
    violations: &mut Violations,
) {
    if let Some(timeout) = &action.timeout {
        if timeout.seconds < 0 || timeout.seconds as u64 > max_timeout.as_secs() {
            violations.invalid(format!("timeout: {}s", timeout.seconds), TIMEOUT_OUT_OF_BOUNDS);
        }
    }
    if action.command_digest.is_none() {
        violations.missing(&proto::Digest::default());
    }
}

pub(crate) fn validate_command(
    command: &proto::Command,
    max_cores: i32,
    violations: &mut Violations,
) {
    strings_unique_and_sorted(
        command.environment_variables.iter().map(|v| v.name.as_str()),
        DUPLICATE_ENVIRONMENT_VARIABLE,
        ENVIRONMENT_VARIABLES_NOT_SORTED,
        violations,
    );
    strings_unique_and_sorted(
        command.output_files.iter().map(String::as_str),
        DUPLICATE_OUTPUT_PATH,
        OUTPUT_PATHS_NOT_SORTED,
        violations,
    );
    strings_unique_and_sorted(
        command.output_directories.iter().map(String::as_str),
        DUPLICATE_OUTPUT_PATH,
        OUTPUT_PATHS_NOT_SORTED,
        violations,
    );
    if let Some(platform) = &command.platform {
        validate_platform(platform, max_cores, violations);
    }
}

fn validate_platform(platform: &proto::Platform, max_cores: i32, violations: &mut Violations) {
    let mut min_cores = None;
    let mut max_declared = None;
    for property in &platform.properties {
        match property.name.as_str() {
            "min-cores" => match property.value.parse::<i32>() {
                Ok(cores) if cores > 0 => min_cores = Some(cores),
                _ => violations.invalid(property.value.clone(), INVALID_CORES_PROPERTY),
            },
            "max-cores" => match property.value.parse::<i32>() {
                Ok(cores) if cores > 0 => max_declared = Some(cores),
                _ => violations.invalid(property.value.clone(), INVALID_CORES_PROPERTY),
            },
            _ => {}
        }
    }
    if let (Some(min), Some(max)) = (min_cores, max_declared) {
        if min > max {
            violations.invalid(format!("{} > {}", min, max), CORES_OUT_OF_BOUNDS);
        }
    }
    if max_cores > 0 {
        if let Some(over) = [min_cores, max_declared]
            .into_iter()
            .flatten()
            .find(|&c| c > max_cores)
        {
            violations.invalid(format!("{} > {}", over, max_cores), CORES_OUT_OF_BOUNDS);
        }
    }
}

fn strings_unique_and_sorted<'a>(
    names: impl Iterator<Item = &'a str>,
    duplicate: &str,
    not_sorted: &str,
    violations: &mut Violations,
) {
    let mut previous: Option<&str> = None;
    for name in names {
        if let Some(previous) = previous {
            if name == previous {
                violations.invalid(name.to_string(), duplicate);
            } else if name < previous {
                violations.invalid(name.to_string(), not_sorted);
            }
        }
        previous = Some(name);
    }
}

pub(crate) fn validate_tree(tree: &proto::Tree, violations: &mut Violations) {
    let Some(root) = &tree.root_digest else {
        violations.missing(&proto::Digest::default());
        return;
    };
    let mut path = Vec::new();
    let mut visited = HashSet::new();
    walk_directory(tree, root, &mut path, &mut visited, violations);
}

fn walk_directory(
    tree: &proto::Tree,
    digest: &proto::Digest,
    path: &mut Vec<proto::Digest>,
    visited: &mut HashSet<proto::Digest>,
    violations: &mut Violations,
) {
    // A digest recurring on the current root-to-node path is a cycle. The
    // path check comes first: the visited set is path-independent and must
    // not mask it.
    if path.contains(digest) {
        violations.add(
            VIOLATION_TYPE_INVALID,
            blob_name(digest),
            DIRECTORY_CYCLE_DETECTED,
        );
        return;
    }
    if !visited.insert(digest.clone()) {
        return;
    }
    let Some(directory) = lookup(tree, digest) else {
        violations.missing(digest);
        return;
    };
    validate_directory_entries(&directory, digest, violations);
    path.push(digest.clone());
    for child in &directory.directories {
        if let Some(child_digest) = &child.digest {
            walk_directory(tree, child_digest, path, visited, violations);
        }
    }
    path.pop();
}

fn lookup<'a>(tree: &'a proto::Tree, digest: &proto::Digest) -> Option<Cow<'a, proto::Directory>> {
    if digest.is_empty() {
        return Some(Cow::Owned(proto::Directory::default()));
    }
    tree.directories.get(&digest.hash).map(Cow::Borrowed)
}

fn validate_directory_entries(
    directory: &proto::Directory,
    digest: &proto::Digest,
    violations: &mut Violations,
) {
    check_sorted(directory.files.iter().map(|f| f.name.as_str()), digest, violations);
    check_sorted(
        directory.directories.iter().map(|d| d.name.as_str()),
        digest,
        violations,
    );
    check_sorted(
        directory.symlinks.iter().map(|s| s.name.as_str()),
        digest,
        violations,
    );

    // Names must be unique across the three entry lists.
    let mut seen = HashSet::new();
    for name in directory
        .files
        .iter()
        .map(|f| f.name.as_str())
        .chain(directory.directories.iter().map(|d| d.name.as_str()))
        .chain(directory.symlinks.iter().map(|s| s.name.as_str()))
    {
        if !seen.insert(name) {
            violations.invalid(entry_subject(digest, name), DUPLICATE_DIRENT);
        }
    }
}

/// Strict name ordering within one entry list. Equal neighbors are left
/// to the cross-list duplicate check so they surface once.
fn check_sorted<'a>(
    names: impl Iterator<Item = &'a str>,
    digest: &proto::Digest,
    violations: &mut Violations,
) {
    let mut previous: Option<&str> = None;
    for name in names {
        if let Some(previous) = previous {
            if name < previous {
                violations.invalid(entry_subject(digest, name), DIRECTORY_NOT_SORTED);
            }
        }
        previous = Some(name);
    }
}

fn entry_subject(digest: &proto::Digest, name: &str) -> String {
    format!("{}: {}", blob_name(digest), name)
}
