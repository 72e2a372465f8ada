use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spotfilter::app::{run_extract, ExtractConfig};
use spotfilter::image::save_plane;
use spotfilter::batch::DEFAULT_SCALE_NORM;
use spotfilter::{
    run_batch, BatchIo, BatchOptions, BatchPlan, BinVolumeStore, CancelToken, ChannelRole,
    FilterConfig, FilterPipeline, JobKey, JobStatus, MaxIntensityProjection, PipelineError,
    VolumeLoader,
};

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("spotfilter-it-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn noisy_volume(rng: &mut StdRng, nz: usize) -> Array3<u16> {
    let mut v = Array3::from_shape_fn((24, 24, nz), |_| rng.gen_range(900u16..1100));
    v[[12, 12, nz / 2]] = 9000;
    v
}

struct MemoryLoader {
    volumes: HashMap<JobKey, Array3<u16>>,
    loads: AtomicUsize,
}

impl VolumeLoader for MemoryLoader {
    fn load_volume(&self, key: JobKey) -> spotfilter::error::Result<Array3<u16>> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.volumes
            .get(&key)
            .cloned()
            .ok_or(PipelineError::MissingPlane { key, z: 0 })
    }
}

fn plan() -> BatchPlan {
    BatchPlan {
        tiles: vec![0, 1],
        rounds: vec![0],
        channels: vec![1],
        anchor_round: Some(1),
        anchor_channel: Some(1),
        dapi_channel: Some(0),
    }
}

fn loader_for(plan: &BatchPlan, seed: u64) -> MemoryLoader {
    let mut rng = StdRng::seed_from_u64(seed);
    let volumes = plan
        .jobs()
        .into_iter()
        .map(|k| (k, noisy_volume(&mut rng, 3)))
        .collect();
    MemoryLoader {
        volumes,
        loads: AtomicUsize::new(0),
    }
}

#[test]
fn batch_writes_every_job_and_skips_existing_output() {
    let plan = plan();
    let loader = loader_for(&plan, 11);
    let store = BinVolumeStore::new(scratch("batch"));
    let pipeline =
        FilterPipeline::new(FilterConfig::new(2, None).unwrap().with_dapi_radius(3)).unwrap();
    let io = BatchIo {
        loader: &loader,
        store: &store,
        stacker: &MaxIntensityProjection,
    };

    let first = run_batch(&pipeline, &plan, io, &BatchOptions::default(), &CancelToken::new());
    assert_eq!(first.written, 6);
    assert!(first.is_success());
    // one reference volume per round group for the scale estimate
    assert_eq!(loader.loads.load(Ordering::Relaxed), 8);
    assert!(first.scale.is_some() && first.scale_anchor.is_some());
    for job in &first.jobs {
        let JobStatus::Written { auto_thresh, .. } = &job.status else {
            panic!("{} not written: {:?}", job.key, job.status);
        };
        let nuclear = plan.role_of(job.key) == ChannelRole::NuclearStain;
        assert_eq!(auto_thresh.is_none(), nuclear);
        let out = store.read(job.key).unwrap();
        assert_eq!(out.dim(), (24, 24, 1));
        assert!(out[[12, 12, 0]] > 0);
    }

    let second = run_batch(&pipeline, &plan, io, &BatchOptions::default(), &CancelToken::new());
    assert_eq!(second.skipped, 6);
    assert_eq!(loader.loads.load(Ordering::Relaxed), 8);
    assert_eq!(second.scale, None);

    let forced = BatchOptions {
        overwrite: true,
        ..BatchOptions::default()
    };
    let third = run_batch(&pipeline, &plan, io, &forced, &CancelToken::new());
    assert_eq!(third.written, 6);

    let _ = std::fs::remove_dir_all(store.root());
}

#[test]
fn anchor_round_uses_its_own_scale() {
    let plan = plan();
    let loader = loader_for(&plan, 21);
    let store = BinVolumeStore::new(scratch("anchor-scale"));
    let pipeline =
        FilterPipeline::new(FilterConfig::new(2, None).unwrap().with_dapi_radius(3)).unwrap();
    let opts = BatchOptions {
        scale: Some(1.0),
        scale_anchor: Some(3.0),
        ..BatchOptions::default()
    };
    let summary = run_batch(
        &pipeline,
        &plan,
        BatchIo {
            loader: &loader,
            store: &store,
            stacker: &MaxIntensityProjection,
        },
        &opts,
        &CancelToken::new(),
    );
    assert_eq!(summary.written, 6);
    assert_eq!((summary.scale, summary.scale_anchor), (Some(1.0), Some(3.0)));
    // fixed scales need no reference volumes
    assert_eq!(loader.loads.load(Ordering::Relaxed), 6);
    for job in &summary.jobs {
        let JobStatus::Written { scale, histogram, .. } = &job.status else {
            panic!("{} not written: {:?}", job.key, job.status);
        };
        let expected = match plan.role_of(job.key) {
            ChannelRole::NuclearStain => None,
            ChannelRole::BandPass if job.key.round == 1 => Some(3.0),
            ChannelRole::BandPass => Some(1.0),
        };
        assert_eq!(*scale, expected, "{}", job.key);
        if let Some(hist) = histogram {
            assert_eq!(hist.total(), 24 * 24);
        }
        assert_eq!(histogram.is_some(), expected.is_some());
    }
    let _ = std::fs::remove_dir_all(store.root());
}

#[test]
fn estimated_scale_maps_reference_peak_to_scale_norm() {
    let plan = BatchPlan {
        tiles: vec![0],
        rounds: vec![0],
        channels: vec![0],
        ..BatchPlan::default()
    };
    let loader = loader_for(&plan, 8);
    let store = BinVolumeStore::new(scratch("auto-scale"));
    let pipeline = FilterPipeline::new(FilterConfig::new(2, None).unwrap()).unwrap();
    let summary = run_batch(
        &pipeline,
        &plan,
        BatchIo {
            loader: &loader,
            store: &store,
            stacker: &MaxIntensityProjection,
        },
        &BatchOptions::default(),
        &CancelToken::new(),
    );
    assert_eq!(summary.written, 1);
    assert!(summary.scale.is_some());
    assert_eq!(summary.scale_anchor, None);

    let out = store.read(JobKey::new(0, 0, 0)).unwrap();
    let peak = out.iter().copied().max().unwrap();
    assert!((peak - DEFAULT_SCALE_NORM as i32).abs() <= 35, "peak {peak}");
    let _ = std::fs::remove_dir_all(store.root());
}

#[test]
fn out_of_range_scale_norm_fails_band_pass_jobs() {
    let plan = plan();
    let loader = loader_for(&plan, 4);
    let store = BinVolumeStore::new(scratch("bad-norm"));
    let pipeline =
        FilterPipeline::new(FilterConfig::new(2, None).unwrap().with_dapi_radius(3)).unwrap();
    let opts = BatchOptions {
        scale_norm: 1.0,
        ..BatchOptions::default()
    };
    let summary = run_batch(
        &pipeline,
        &plan,
        BatchIo {
            loader: &loader,
            store: &store,
            stacker: &MaxIntensityProjection,
        },
        &opts,
        &CancelToken::new(),
    );
    // only the nuclear-stain job needs no scale
    assert_eq!((summary.written, summary.failed), (2, 4));
    assert!(summary.jobs.iter().all(|j| match &j.status {
        JobStatus::Failed { error } => error.contains("scale_norm"),
        JobStatus::Written { .. } => plan.role_of(j.key) == ChannelRole::NuclearStain,
        _ => false,
    }));
    let _ = std::fs::remove_dir_all(store.root());
}

#[test]
fn cancelled_batch_persists_nothing() {
    let plan = plan();
    let loader = loader_for(&plan, 3);
    let store = BinVolumeStore::new(scratch("cancel"));
    let pipeline = FilterPipeline::new(FilterConfig::new(2, None).unwrap().with_dapi_radius(3)).unwrap();
    let token = CancelToken::new();
    token.cancel();

    let summary = run_batch(
        &pipeline,
        &plan,
        BatchIo {
            loader: &loader,
            store: &store,
            stacker: &MaxIntensityProjection,
        },
        &BatchOptions::default(),
        &token,
    );
    assert_eq!(summary.cancelled, 6);
    assert!(plan.jobs().iter().all(|&k| !store.path_for(k).exists()));
    let _ = std::fs::remove_dir_all(store.root());
}

#[test]
fn missing_input_fails_only_that_job() {
    let plan = plan();
    let mut loader = loader_for(&plan, 5);
    loader.volumes.remove(&JobKey::new(1, 0, 1));
    let store = BinVolumeStore::new(scratch("missing"));
    let pipeline = FilterPipeline::new(FilterConfig::new(1, None).unwrap().with_dapi_radius(2)).unwrap();

    let summary = run_batch(
        &pipeline,
        &plan,
        BatchIo {
            loader: &loader,
            store: &store,
            stacker: &MaxIntensityProjection,
        },
        &BatchOptions::default(),
        &CancelToken::new(),
    );
    assert_eq!((summary.written, summary.failed), (5, 1));
    let failed: Vec<_> = summary
        .jobs
        .iter()
        .filter(|j| matches!(j.status, JobStatus::Failed { .. }))
        .map(|j| j.key)
        .collect();
    assert_eq!(failed, vec![JobKey::new(1, 0, 1)]);
    let _ = std::fs::remove_dir_all(store.root());
}

#[test]
fn extract_run_from_png_planes_writes_summary() {
    let root = scratch("extract");
    let input = root.join("raw");
    std::fs::create_dir_all(&input).unwrap();
    let mut rng = StdRng::seed_from_u64(99);
    let key = JobKey::new(0, 0, 0);
    let raw = noisy_volume(&mut rng, 2);
    for z in 0..2 {
        save_plane(&input.join(format!("{key}_z{z}.png")), &raw, z).unwrap();
    }

    let cfg = ExtractConfig {
        input_dir: Some(input),
        output_dir: Some(root.join("filtered")),
        n_z: Some(2),
        r1: Some(2),
        summary_json: Some(root.join("summary.json")),
        ..Default::default()
    };
    let summary = run_extract(&cfg, &CancelToken::new()).unwrap();
    assert_eq!(summary.written, 1);

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(root.join("summary.json")).unwrap()).unwrap();
    assert_eq!(json["written"], 1);
    assert_eq!(json["jobs"][0]["status"], "written");
    assert_eq!(json["jobs"][0]["tile"], 0);
    assert!(json["scale"].as_f64().unwrap() > 0.0);
    assert!(json["jobs"][0]["histogram"]["counts"].is_object());

    let out = BinVolumeStore::new(root.join("filtered")).read(key).unwrap();
    assert_eq!(out.dim(), (24, 24, 1));
    let _ = std::fs::remove_dir_all(&root);
}
