//! Adapter for batch jobs. Jobs finish on their own, so a finished job
//! releases its volumes even though the object still exists.

use crate::crd::WorkloadReference;
use crate::error::{Error, Result};
use crate::workload::{
    created_by_controller, decode_object, extract_volumes, released_volumes, AdmittedWorkload,
    VolumeInfo, WorkloadAdapter,
};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PodSpec;
use kube::core::admission::{AdmissionRequest, Operation};
use kube::core::DynamicObject;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use tracing::debug;

pub struct JobAdapter {
    store: Store<Job>,
}

impl JobAdapter {
    pub fn new(store: Store<Job>) -> Self {
        Self { store }
    }

    fn lookup(&self, reference: &WorkloadReference) -> Option<std::sync::Arc<Job>> {
        self.store
            .get(&ObjectRef::new(&reference.name).within(&reference.namespace))
    }
}

fn job_pod_spec(job: &Job) -> Option<&PodSpec> {
    job.spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
}

/// A job is finished once a `Complete` or `Failed` condition turns true.
fn job_finished(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions.iter().any(|condition| {
                (condition.type_ == "Complete" || condition.type_ == "Failed")
                    && condition.status == "True"
            })
        })
        .unwrap_or(false)
}

fn admit_job(request: &AdmissionRequest<DynamicObject>) -> Result<AdmittedWorkload> {
    let job: Job = decode_object("Job", request.object.as_ref())?;

    if created_by_controller(&job) {
        return Err(Error::IrrelevantWorkload {});
    }

    let mut used = extract_volumes(job_pod_spec(&job));
    let mut released = vec![];
    if request.operation == Operation::Update {
        let old: Job = decode_object("Job", request.old_object.as_ref())?;
        if job_finished(&job) {
            // The job ran to completion; everything it used goes back.
            released = extract_volumes(job_pod_spec(&old));
            used = vec![];
        } else {
            released = released_volumes(&used, [job_pod_spec(&old)]);
        }
    }

    let reference = WorkloadReference {
        api_version: "batch/v1".to_string(),
        kind: "Job".to_string(),
        namespace: job.namespace().unwrap_or_default(),
        name: job.name_any(),
        uid: job.uid().unwrap_or_default(),
    };
    debug!(workload = %reference, "processed job");
    Ok(AdmittedWorkload {
        replicas: job.spec.as_ref().and_then(|spec| spec.parallelism),
        reference,
        used,
        released,
    })
}

#[async_trait]
impl WorkloadAdapter for JobAdapter {
    async fn handle(&self, request: &AdmissionRequest<DynamicObject>) -> Result<AdmittedWorkload> {
        admit_job(request)
    }

    async fn mounted_volumes(&self, reference: &WorkloadReference) -> Result<Vec<VolumeInfo>> {
        let Some(job) = self.lookup(reference) else {
            debug!(workload = %reference, "job does not exist");
            return Ok(vec![]);
        };
        // A finished job has released everything it used.
        if job_finished(&job) {
            debug!(workload = %reference, "job is already completed");
            return Ok(vec![]);
        }
        Ok(extract_volumes(job_pod_spec(&job)))
    }

    async fn exist(&self, reference: &WorkloadReference) -> Result<bool> {
        Ok(self.lookup(reference).is_some())
    }
}
