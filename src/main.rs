// src/main.rs
use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use spikesort::sorting::{
    ManualSource, Point, Polygon, SortBox, SortingPipeline, SpikeChannel, SpikeEvent, SpikeSorter,
};
use spikesort::{SortRecorder, SorterConfig};

const SAMPLE_RATE_HZ: f32 = 30_000.0;
const SAMPLES: usize = 32;
const NUM_SPIKES: usize = 1_000;
const ELECTRODE: usize = 0;

// 两种合成模板：大幅度快速尖峰 / 小幅度带正向反弹
fn template(kind: usize, bin: usize) -> f32 {
    let t = bin as f32;
    match kind {
        0 => -120.0 * (-((t - 8.0) / 1.5).powi(2)).exp(),
        _ => -70.0 * (-((t - 12.0) / 2.5).powi(2)).exp() + 25.0 * (-((t - 18.0) / 3.0).powi(2)).exp(),
    }
}

fn synth_events(rng: &mut StdRng) -> Result<Vec<SpikeEvent>> {
    let channel = SpikeChannel::new(1, SAMPLES, SAMPLE_RATE_HZ)
        .context("invalid synthetic channel layout")?;
    let events = (0..NUM_SPIKES)
        .map(|i| {
            let kind = usize::from(rng.gen_bool(0.5));
            let data = (0..SAMPLES)
                .map(|bin| template(kind, bin) + rng.gen_range(-6.0f32..6.0))
                .collect();
            SpikeEvent {
                electrode: ELECTRODE,
                channel,
                data,
                timestamp: i as i64 * 600,
                sorted_id: 0,
            }
        })
        .collect();
    Ok(events)
}

/// Square around the projection of the second template.
fn polygon_around_template(pc1: &[f32], pc2: &[f32]) -> Polygon {
    let (mut x, mut y) = (0.0, 0.0);
    for bin in 0..SAMPLES {
        let v = template(1, bin);
        x += v * pc1[bin];
        y += v * pc2[bin];
    }
    let r = 40.0;
    Polygon::with_offset(
        vec![
            Point::new(-r, -r),
            Point::new(r, -r),
            Point::new(r, r),
            Point::new(-r, r),
        ],
        Point::new(x, y),
    )
}

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => SorterConfig::from_json_file(&path)
            .with_context(|| format!("failed to load sorter config from {path}"))?,
        None => SorterConfig::default(),
    };
    let record_dir = args.next().map(PathBuf::from);

    let mut rng = StdRng::seed_from_u64(7);
    let events = synth_events(&mut rng)?;

    let mut front_end = SpikeSorter::new(config).context("failed to start spike sorter")?;
    let box_unit = front_end
        .ensure_electrode(ELECTRODE, 1, SAMPLES)
        .sorter()
        .add_box_unit_with_box(SortBox::new(200.0, -100.0, 150.0, 60.0, 0));
    log::info!("box unit {box_unit} watches the large template");

    let mut pipeline = SortingPipeline::new(ManualSource::new(events), front_end);
    if let Some(dir) = &record_dir {
        let recorder = SortRecorder::start(dir, "demo").context("failed to open recorder")?;
        pipeline = pipeline.with_recorder(recorder);
    }

    let mut pca_unit = None;
    let mut counts: BTreeMap<u16, usize> = BTreeMap::new();
    while let Some(outcome) = pipeline.pump_once()? {
        let Some(sorted) = outcome else {
            continue;
        };
        if let Some(id) = sorted.sorted_id {
            *counts.entry(id).or_default() += 1;
        }
        if sorted.range_update.is_some() && pca_unit.is_none() {
            let Some(electrode) = pipeline.sorter().electrode(ELECTRODE) else {
                continue;
            };
            let (pc1, pc2) = electrode.sorter().components();
            let id = electrode
                .sorter()
                .add_pca_unit(polygon_around_template(&pc1, &pc2));
            log::info!("PCA ready, polygon unit {id} watches the small template");
            pca_unit = Some(id);
        }
    }

    let stats = pipeline.stats();
    log::info!(
        "received {}, gated {}, sorted {}",
        stats.received,
        stats.gated,
        stats.sorted
    );
    for (id, n) in &counts {
        println!("unit {id}: {n} spikes");
    }

    let (_, front_end, recorder) = pipeline.into_parts();
    if let Some(recorder) = recorder {
        recorder.stop().context("failed to flush recorder")?;
    }
    if let Some(dir) = record_dir {
        let path = dir.join("sorter_state.json");
        front_end
            .save(&path)
            .with_context(|| format!("failed to save sorter state to {}", path.display()))?;
    }
    Ok(())
}
