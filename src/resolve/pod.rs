//! Task to pod specification

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, PodSecurityContext, PodSpec, Volume, VolumeMount,
};
use kube::{Api, Client};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;

use super::subst::substitute_value;
use crate::crd::{
    ContainerRuntimeSettings, EmptyDirSettings, Function, FunctionSpec, LocalBackend,
    RuntimeSettings, Task, LOCAL_BACKEND_VOLUME,
};
use crate::error::{not_found_as, Error, Result};

/// Name of the scratch volume mounted at `/tmp`
pub const TMP_DIR_VOLUME: &str = "tmp-dir";

const TMP_DIR_MOUNT_PATH: &str = "/tmp";

/// A Task with the Functions of its steps, in step order
#[derive(Clone, Debug)]
pub struct ResolvedTask {
    pub task: Task,
    pub functions: Vec<Function>,
}

impl ResolvedTask {
    /// Fetch the Task `name` and every Function it references
    pub async fn fetch(client: &Client, name: &str) -> Result<Self> {
        let tasks: Api<Task> = Api::all(client.clone());
        let task = tasks
            .get(name)
            .await
            .map_err(|e| not_found_as(e, format!("task {}", name)))?;

        let functions_api: Api<Function> = Api::all(client.clone());
        let mut functions = Vec::with_capacity(task.spec.steps.len());
        for step in &task.spec.steps {
            let function = functions_api
                .get(&step.name)
                .await
                .map_err(|e| not_found_as(e, format!("function {}", step.name)))?;
            functions.push(function);
        }
        debug!(task = name, steps = functions.len(), "Fetched task");
        Ok(Self { task, functions })
    }

    /// Pod security policies needed by the task's functions, joined with
    /// `configured`, deduplicated and sorted
    pub fn psp_names(&self, configured: &[String]) -> Vec<String> {
        configured
            .iter()
            .cloned()
            .chain(
                self.functions
                    .iter()
                    .filter_map(|f| f.spec.pod_security_policy_name.clone()),
            )
            .filter(|name| !name.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Turns a [`ResolvedTask`] and its inputs into a pod specification
pub struct TaskResolver<'a> {
    pub task: &'a ResolvedTask,
    pub inputs: &'a BTreeMap<String, String>,
    pub runtime_settings: &'a RuntimeSettings,
    pub temp_dir: Option<&'a EmptyDirSettings>,
}

impl TaskResolver<'_> {
    /// Resolve the pod.
    ///
    /// Every step but the last becomes an init container; the last step is
    /// the main container.
    pub fn pod_spec(&self) -> Result<PodSpec> {
        let steps = &self.task.task.spec.steps;
        if steps.is_empty() {
            return Err(Error::resolve(format!(
                "task {} has no steps",
                self.task.task.metadata.name.clone().unwrap_or_default()
            )));
        }

        let mut containers = Vec::with_capacity(steps.len());
        let mut names = BTreeSet::new();
        for (step, function) in steps.iter().zip(&self.task.functions) {
            let mut vars = self.inputs.clone();
            vars.extend(step.params.iter().map(|p| (p.name.clone(), p.value.clone())));

            let spec: FunctionSpec = resolve_with(&function.spec, &vars)?;
            let mut name = container_name(&step.name);
            if !names.insert(name.clone()) {
                name = format!("{}-{}", name, containers.len());
                names.insert(name.clone());
            }
            containers.push(self.container(name, spec));
        }

        let mut volumes: Vec<Volume> = resolve_with(&self.task.task.spec.volumes, self.inputs)?;
        volumes.push(self.tmp_volume());

        let main = containers.pop().into_iter().collect();
        let mut pod = PodSpec {
            init_containers: if containers.is_empty() { None } else { Some(containers) },
            containers: main,
            volumes: Some(volumes),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        };

        if let Some(settings) = &self.runtime_settings.pod {
            pod.node_selector = settings.node_selector.clone();
            pod.service_account_name = settings.service_account_name.clone();
            pod.image_pull_secrets = settings.image_pull_secrets.clone();
            pod.affinity = settings.affinity.clone();
            pod.tolerations = settings.tolerations.clone();
            pod.priority_class_name = settings.priority_class_name.clone();
            pod.security_context = settings.security_context.clone();
        }
        Ok(pod)
    }

    fn container(&self, name: String, spec: FunctionSpec) -> Container {
        let mut mounts = spec.volume_mounts;
        mounts.push(VolumeMount {
            name: TMP_DIR_VOLUME.to_string(),
            mount_path: TMP_DIR_MOUNT_PATH.to_string(),
            ..Default::default()
        });

        let mut container = Container {
            name,
            image: Some(spec.image),
            command: non_empty(spec.command),
            args: non_empty(spec.args),
            working_dir: spec.working_dir,
            ports: non_empty(spec.ports),
            volume_mounts: Some(mounts),
            ..Default::default()
        };
        if let Some(defaults) = &spec.runtime_settings {
            apply_container_settings(&mut container, defaults);
        }
        if let Some(settings) = &self.runtime_settings.container {
            apply_container_settings(&mut container, settings);
        }
        container
    }

    fn tmp_volume(&self) -> Volume {
        Volume {
            name: TMP_DIR_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: self.temp_dir.and_then(|t| t.medium.clone()),
                size_limit: self.temp_dir.and_then(|t| t.size_limit.clone()),
            }),
            ..Default::default()
        }
    }
}

fn resolve_with<T>(value: &T, vars: &BTreeMap<String, String>) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut json = serde_json::to_value(value)?;
    substitute_value(&mut json, vars)?;
    Ok(serde_json::from_value(json)?)
}

fn container_name(function: &str) -> String {
    function
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn apply_container_settings(container: &mut Container, settings: &ContainerRuntimeSettings) {
    if let Some(resources) = &settings.resources {
        container.resources = Some(resources.clone());
    }
    if let Some(env) = &settings.env {
        let current = container.env.get_or_insert_with(Vec::new);
        for var in env {
            upsert_env(current, var.clone());
        }
    }
    if let Some(sc) = &settings.security_context {
        container.security_context = Some(sc.clone());
    }
    if let Some(policy) = &settings.image_pull_policy {
        container.image_pull_policy = Some(policy.clone());
    }
}

fn upsert_env(env: &mut Vec<EnvVar>, var: EnvVar) {
    match env.iter_mut().find(|e| e.name == var.name) {
        Some(existing) => *existing = var,
        None => env.push(var),
    }
}

/// Security context a restore pod runs with unless the user says otherwise
pub fn default_restore_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_user: Some(0),
        run_as_group: Some(0),
        ..Default::default()
    }
}

/// Fill the fields `user` leaves unset from `defaults`
pub fn upsert_pod_security_context(
    defaults: PodSecurityContext,
    user: Option<PodSecurityContext>,
) -> Result<PodSecurityContext> {
    let Some(user) = user else {
        return Ok(defaults);
    };
    let mut merged = serde_json::to_value(defaults)?;
    if let (Value::Object(base), Value::Object(overlay)) = (&mut merged, serde_json::to_value(user)?) {
        for (k, v) in overlay {
            if !v.is_null() {
                base.insert(k, v);
            }
        }
    }
    Ok(serde_json::from_value(merged)?)
}

/// Mount the local backend volume into every container of the pod
pub fn attach_local_backend(pod: &mut PodSpec, local: &LocalBackend) {
    let volumes = pod.volumes.get_or_insert_with(Vec::new);
    if !volumes.iter().any(|v| v.name == LOCAL_BACKEND_VOLUME) {
        volumes.push(local.to_volume());
    }

    let mount = VolumeMount {
        name: LOCAL_BACKEND_VOLUME.to_string(),
        mount_path: local.mount_path.clone(),
        sub_path: local.sub_path.clone(),
        ..Default::default()
    };
    let init = pod.init_containers.iter_mut().flatten();
    for container in init.chain(pod.containers.iter_mut()) {
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        if !mounts.iter().any(|m| m.name == LOCAL_BACKEND_VOLUME) {
            mounts.push(mount.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{FunctionRef, Param, PodRuntimeSettings, TaskSpec};
    use k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource;

    fn function(name: &str, image: &str, args: &[&str]) -> Function {
        Function::new(
            name,
            FunctionSpec {
                image: image.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        )
    }

    fn pg_task() -> ResolvedTask {
        let task = Task::new(
            "pg-restore",
            TaskSpec {
                steps: vec![
                    FunctionRef {
                        name: "pg-restore".to_string(),
                        params: vec![Param {
                            name: "DB_VERSION".to_string(),
                            value: "11".to_string(),
                        }],
                    },
                    FunctionRef {
                        name: "update-status".to_string(),
                        params: vec![],
                    },
                ],
                volumes: vec![],
            },
        );
        ResolvedTask {
            task,
            functions: vec![
                function(
                    "pg-restore",
                    "osodevops/pg:${DB_VERSION:=10}",
                    &["restore", "--bucket=${REPOSITORY_BUCKET}"],
                ),
                function("update-status", "osodevops/restic:0.9", &["--namespace=${NAMESPACE}"]),
            ],
        }
    }

    fn inputs() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("REPOSITORY_BUCKET".to_string(), "backups".to_string()),
            ("NAMESPACE".to_string(), "demo".to_string()),
        ])
    }

    #[test]
    fn steps_become_init_and_main_containers() {
        let task = pg_task();
        let inputs = inputs();
        let settings = RuntimeSettings::default();
        let pod = TaskResolver {
            task: &task,
            inputs: &inputs,
            runtime_settings: &settings,
            temp_dir: None,
        }
        .pod_spec()
        .unwrap();

        let init = pod.init_containers.as_ref().unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].image.as_deref(), Some("osodevops/pg:11"));
        assert_eq!(init[0].args.as_ref().unwrap()[1], "--bucket=backups");
        assert_eq!(pod.containers.len(), 1);
        assert_eq!(pod.containers[0].name, "update-status");
        assert_eq!(pod.containers[0].args.as_ref().unwrap()[0], "--namespace=demo");
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));

        let volumes = pod.volumes.unwrap();
        assert!(volumes.iter().any(|v| v.name == TMP_DIR_VOLUME && v.empty_dir.is_some()));
        assert!(pod.containers[0]
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .any(|m| m.mount_path == "/tmp"));
    }

    #[test]
    fn task_without_steps_is_rejected() {
        let task = ResolvedTask {
            task: Task::new("empty", TaskSpec::default()),
            functions: vec![],
        };
        let inputs = inputs();
        let settings = RuntimeSettings::default();
        let err = TaskResolver {
            task: &task,
            inputs: &inputs,
            runtime_settings: &settings,
            temp_dir: None,
        }
        .pod_spec()
        .unwrap_err();
        assert!(matches!(err, Error::Resolve(_)));
    }

    #[test]
    fn pod_runtime_settings_applied() {
        let task = pg_task();
        let inputs = inputs();
        let settings = RuntimeSettings {
            pod: Some(PodRuntimeSettings {
                service_account_name: Some("restore-sa".to_string()),
                priority_class_name: Some("critical".to_string()),
                ..Default::default()
            }),
            container: Some(ContainerRuntimeSettings {
                image_pull_policy: Some("Always".to_string()),
                ..Default::default()
            }),
        };
        let pod = TaskResolver {
            task: &task,
            inputs: &inputs,
            runtime_settings: &settings,
            temp_dir: None,
        }
        .pod_spec()
        .unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("restore-sa"));
        assert_eq!(pod.priority_class_name.as_deref(), Some("critical"));
        assert_eq!(pod.containers[0].image_pull_policy.as_deref(), Some("Always"));
        assert_eq!(
            pod.init_containers.unwrap()[0].image_pull_policy.as_deref(),
            Some("Always")
        );
    }

    #[test]
    fn user_security_context_fields_are_kept() {
        let user = PodSecurityContext {
            run_as_user: Some(1000),
            fs_group: Some(2000),
            ..Default::default()
        };
        let merged = upsert_pod_security_context(default_restore_security_context(), Some(user)).unwrap();
        assert_eq!(merged.run_as_user, Some(1000));
        assert_eq!(merged.run_as_group, Some(0));
        assert_eq!(merged.fs_group, Some(2000));

        let defaulted = upsert_pod_security_context(default_restore_security_context(), None).unwrap();
        assert_eq!(defaulted.run_as_user, Some(0));
    }

    #[test]
    fn local_backend_is_mounted_everywhere_once() {
        let mut pod = PodSpec {
            init_containers: Some(vec![Container {
                name: "pg-restore".to_string(),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: "update-status".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let local = LocalBackend {
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: "repo-pvc".to_string(),
                read_only: None,
            }),
            mount_path: "/safe/data".to_string(),
            ..Default::default()
        };
        attach_local_backend(&mut pod, &local);
        attach_local_backend(&mut pod, &local);

        assert_eq!(pod.volumes.as_ref().unwrap().len(), 1);
        for c in pod.init_containers.iter().flatten().chain(pod.containers.iter()) {
            let mounts = c.volume_mounts.as_ref().unwrap();
            assert_eq!(mounts.len(), 1);
            assert_eq!(mounts[0].mount_path, "/safe/data");
        }
    }

    #[test]
    fn psp_names_are_deduplicated() {
        let mut task = pg_task();
        task.functions[0].spec.pod_security_policy_name = Some("privileged".to_string());
        task.functions[1].spec.pod_security_policy_name = Some("baseline".to_string());
        let names = task.psp_names(&["privileged".to_string()]);
        assert_eq!(names, vec!["baseline".to_string(), "privileged".to_string()]);
    }
}
