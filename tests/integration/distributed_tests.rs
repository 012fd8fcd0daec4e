//! Multi-replica training over the in-process group

use std::sync::Arc;
use std::thread;

use adagan::training::{LocalProcessGroup, NoopCallbacks, ProcessGroup, TrainingLoop};
use adagan::Result;
use candle_core::Device;

use super::fixtures::*;
use super::init_test_logging;

type Values = Vec<(String, Vec<f32>)>;

#[test]
fn test_two_replicas_stay_in_sync() -> Result<()> {
    init_test_logging();
    let dir = create_test_dir();
    let mut config = test_config(dir.path());
    config.distributed.num_replicas = 2;
    config.logging.stats_jsonl = true;
    let dataset = stub_dataset();

    let handles: Vec<_> = LocalProcessGroup::create(2)?
        .into_iter()
        .map(|group| {
            let config = config.clone();
            let dataset = dataset.clone();
            thread::spawn(move || -> Result<(u64, Values, Values)> {
                let mut trainer = TrainingLoop::new(
                    config,
                    dataset,
                    Arc::new(group),
                    &Device::Cpu,
                    Box::new(NoopCallbacks),
                )?;
                let result = trainer.train()?;
                Ok((
                    result.final_state.cur_nimg,
                    network_values(trainer.generator().as_ref()),
                    network_values(trainer.discriminator().as_ref()),
                ))
            })
        })
        .collect();

    let results = handles
        .into_iter()
        .map(|h| h.join().expect("replica panicked"))
        .collect::<Result<Vec<_>>>()?;

    let (nimg0, g0, d0) = &results[0];
    let (nimg1, g1, d1) = &results[1];
    assert_eq!(*nimg0, 20);
    assert_eq!(nimg0, nimg1);
    assert_eq!(d0, d1);
    // w_avg tracks each replica's own latents
    let params = |v: &Values| v.iter().filter(|(n, _)| n != "mapping.w_avg").cloned().collect::<Vec<_>>();
    assert_eq!(params(g0), params(g1));

    // Only the coordinator writes run outputs
    let stats = std::fs::read_to_string(dir.path().join("stats.jsonl"))?;
    assert_eq!(stats.lines().count(), 2);
    Ok(())
}

#[test]
fn test_group_rank_layout() -> Result<()> {
    let groups = LocalProcessGroup::create(3)?;
    let ranks: Vec<_> = groups.iter().map(|g| g.rank()).collect();
    assert_eq!(ranks, vec![0, 1, 2]);
    assert!(groups[0].is_coordinator());
    assert!(groups.iter().all(|g| g.world_size() == 3));
    Ok(())
}
