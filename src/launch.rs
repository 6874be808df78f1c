//! Start-up of a run: build each worker's `Simulation` from the
//! configuration and drive it, either on one thread, on several pinned
//! threads of this process, or as one rank of a multi-process run.
//!

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;
use core_affinity::{get_core_ids, set_for_current};
use log::{error, info};
use crate::config::{Config, Control};
use crate::error::{ExchangeError, SolverError};
use crate::exchange::{Exchange, LocalExchange, MessageExchange};
use crate::gas::GasModel;
use crate::message::{ChannelCommunicator, Communicator, TcpCommunicator};
use crate::output::OutputWriter;
use crate::scheduler::{Simulation, StopReason};
use crate::setup;




/// Where a run writes and how it is stopped.
///
#[derive(Clone, Debug)]
pub struct LaunchOptions {
    pub run_dir: PathBuf,
    pub job: String,
    pub compressed: bool,
    pub start_tindx: usize,
    pub max_wall_clock: Option<Duration>,
    pub halt: Arc<AtomicBool>,
}




/// Build the simulation of one worker, owning the blocks `owner` assigns to
/// `exchange.rank()`. If the blocks cannot be built, the other workers are
/// aborted.
///
pub fn build_simulation(
    config: &Config,
    control: &Control,
    mut exchange: Box<dyn Exchange>,
    owner: &HashMap<usize, usize>,
    options: &LaunchOptions) -> Result<Simulation, SolverError>
{
    let gas: Arc<dyn GasModel> = Arc::new(config.gas.clone());
    let ids = setup::owned_blocks(owner, exchange.rank());

    let blocks = match setup::build_blocks(config, &gas, ids) {
        Ok(blocks) => blocks,
        Err(e) => {
            exchange.abort();
            return Err(e);
        }
    };
    let output = OutputWriter::new(&options.run_dir, &options.job, options.compressed);
    let control_path = output.control_path();

    let mut sim = Simulation::new(config.clone(), control.clone(), gas, blocks)
        .with_exchange(exchange)
        .with_output(output)
        .with_control_file(control_path)
        .with_halt_flag(Arc::clone(&options.halt));

    if let Some(budget) = options.max_wall_clock {
        sim = sim.with_max_wall_clock(budget);
    }
    Ok(sim)
}

fn run_rank<C>(config: &Config, control: &Control, comm: C, owner: &HashMap<usize, usize>, options: &LaunchOptions) -> Result<Vec<StopReason>, SolverError>
where
    C: Communicator + 'static,
{
    let exchange = Box::new(MessageExchange::new(comm, owner.clone()));
    build_simulation(config, control, exchange, owner, options)?.run(options.start_tindx)
}




/// Run every block on the current thread.
///
pub fn run_single(config: &Config, control: &Control, options: &LaunchOptions) -> Result<Vec<StopReason>, SolverError> {
    let owner = setup::partition_blocks(config.blocks.len(), 1);
    build_simulation(config, control, Box::new(LocalExchange), &owner, options)?.run(options.start_tindx)
}




/// Run `workers` in-process workers, each on its own thread pinned to a
/// core where the platform allows it, exchanging over crossbeam channels.
/// Returns the stop reasons of rank 0, or the first error in rank order.
///
pub fn run_workers(config: &Config, control: &Control, workers: usize, options: &LaunchOptions) -> Result<Vec<StopReason>, SolverError> {
    let workers = workers.max(1);
    let owner = setup::partition_blocks(config.blocks.len(), workers);
    let core_ids = get_core_ids().unwrap_or_default();
    info!("starting {} workers over {} blocks", workers, config.blocks.len());

    let handles: Vec<_> = ChannelCommunicator::group(workers)
        .into_iter()
        .enumerate()
        .map(|(rank, comm)| {
            let core_id = if core_ids.is_empty() { None } else { Some(core_ids[rank % core_ids.len()]) };
            let (config, control, owner, options) = (config.clone(), control.clone(), owner.clone(), options.clone());

            thread::spawn(move || {
                if let Some(core_id) = core_id {
                    set_for_current(core_id);
                }
                run_rank(&config, &control, comm, &owner, &options)
            })
        })
        .collect();

    let mut results = Vec::with_capacity(workers);

    for (rank, handle) in handles.into_iter().enumerate() {
        let result = handle.join().unwrap_or_else(|_| {
            error!("worker {} panicked", rank);
            Err(SolverError::Collaborator(format!("worker {} panicked", rank)))
        });
        results.push(result);
    }
    combine_results(results)
}

/// Rank 0's stop reasons if every worker succeeded. Otherwise the error of
/// the worker that failed first, rather than those of the peers it aborted.
///
fn combine_results(results: Vec<Result<Vec<StopReason>, SolverError>>) -> Result<Vec<StopReason>, SolverError> {
    let mut aborted = None;
    let mut first = None;

    for result in results {
        match result {
            Ok(reasons) => {
                first.get_or_insert(reasons);
            }
            Err(SolverError::Exchange(ExchangeError::PeerFailed(message))) => {
                aborted.get_or_insert(SolverError::Exchange(ExchangeError::PeerFailed(message)));
            }
            Err(e) => return Err(e),
        }
    }
    match aborted {
        Some(e) => Err(e),
        None => Ok(first.unwrap_or_default()),
    }
}




/// Run as rank `rank` of a multi-process run, reaching the other ranks at
/// the given addresses.
///
pub fn run_tcp_rank(config: &Config, control: &Control, rank: usize, peers: Vec<SocketAddr>, options: &LaunchOptions) -> Result<Vec<StopReason>, SolverError> {
    let owner = setup::partition_blocks(config.blocks.len(), peers.len());
    let comm = TcpCommunicator::new(rank, peers)
        .map_err(|e| SolverError::Exchange(ExchangeError::Transport(e.to_string())))?;
    run_rank(config, control, comm, &owner, options)
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::config::{BcSpec, BlockConfig, FaceBcs, InitialState};
    use crate::error::GasError;
    use crate::gas::GasState;
    use crate::geometry::{Face, Vector3d};
    use crate::physics::{EnergyExchange, Physics};

    fn duct() -> Config {
        let inflow = InitialState { vel: Vector3d::new(1000.0, 0.0, 0.0), ..InitialState::default() };
        let blocks = (0..2)
            .map(|id| BlockConfig {
                shape: [6, 3, 1],
                origin: Vector3d::new(0.06 * id as f64, 0.0, 0.0),
                initial: if id == 0 { inflow.clone() } else { InitialState::default() },
                bcs: FaceBcs {
                    west: if id == 0 {
                        BcSpec::SupersonicIn { state: inflow.clone() }
                    } else {
                        BcSpec::Exchange { block: 0, face: Face::East, orientation: 0 }
                    },
                    east: if id == 0 {
                        BcSpec::Exchange { block: 1, face: Face::West, orientation: 0 }
                    } else {
                        BcSpec::ExtrapolateOut
                    },
                    ..FaceBcs::default()
                },
                ..BlockConfig::default()
            })
            .collect();
        Config { blocks, ..Config::default() }
    }

    fn options(dir: &std::path::Path, job: &str) -> LaunchOptions {
        LaunchOptions {
            run_dir: dir.to_owned(),
            job: job.to_owned(),
            compressed: false,
            start_tindx: 0,
            max_wall_clock: None,
            halt: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn two_workers_match_a_single_worker() {
        let config = duct();
        let control = Control { max_step: 20, cfl_count: 5, ..Control::default() };
        let dir = tempfile::tempdir().unwrap();

        let single = run_single(&config, &control, &options(dir.path(), "single")).unwrap();
        let split = run_workers(&config, &control, 2, &options(dir.path(), "split")).unwrap();
        assert_eq!(single, vec![StopReason::ReachedMaxStep]);
        assert_eq!(split, single);

        let a = std::fs::read_to_string(dir.path().join("single.times")).unwrap();
        let b = std::fs::read_to_string(dir.path().join("split.times")).unwrap();
        assert_eq!(a, b);

        for id in 0..2 {
            let path_a = OutputWriter::new(dir.path(), "single", false).flow_path(id, 9999);
            let path_b = OutputWriter::new(dir.path(), "split", false).flow_path(id, 9999);
            let snap_a = crate::output::read_block_snapshot(&path_a, false).unwrap();
            let snap_b = crate::output::read_block_snapshot(&path_b, false).unwrap();
            assert_eq!(snap_a.cells, snap_b.cells);
        }
    }

    struct Unavailable;

    impl EnergyExchange for Unavailable {
        fn advance(&self, _gas: &mut GasState, _dt: f64) -> Result<(), GasError> {
            Err(GasError::Collaborator("relaxation rates unavailable".into()))
        }
    }

    #[test]
    fn a_failing_worker_stops_its_peers() {
        let config = Config { energy_exchange: true, ..duct() };
        let control = Control { max_step: 20, cfl_count: 5, ..Control::default() };
        let dir = tempfile::tempdir().unwrap();
        let options = options(dir.path(), "failing");
        let owner = setup::partition_blocks(config.blocks.len(), 2);
        let (done, finished) = crossbeam_channel::unbounded();

        for comm in ChannelCommunicator::group(2) {
            let (config, control, owner, options, done) = (config.clone(), control.clone(), owner.clone(), options.clone(), done.clone());

            thread::spawn(move || {
                let rank = comm.rank();
                let exchange = Box::new(MessageExchange::new(comm, owner.clone()));
                let mut physics = Physics::default();

                if rank == 1 {
                    physics.energy_exchange = Some(Box::new(Unavailable));
                }
                let result = build_simulation(&config, &control, exchange, &owner, &options)
                    .and_then(|sim| sim.with_physics(physics).run(0));
                done.send((rank, result)).unwrap();
            });
        }

        let mut results: Vec<_> = (0..2)
            .map(|_| finished.recv_timeout(Duration::from_secs(60)).expect("a worker never returned"))
            .collect();
        results.sort_by_key(|(rank, _)| *rank);

        assert!(matches!(results[0].1, Err(SolverError::Exchange(ExchangeError::PeerFailed(_)))));
        assert!(matches!(results[1].1, Err(SolverError::Collaborator(_))));

        let combined = combine_results(results.into_iter().map(|(_, result)| result).collect());
        assert!(matches!(combined, Err(SolverError::Collaborator(_))));
    }

    #[test]
    fn combined_results_prefer_the_root_failure() {
        let aborted = || Err(SolverError::Exchange(ExchangeError::PeerFailed("rank 1 aborted".into())));
        let ok = || Ok(vec![StopReason::ReachedMaxStep]);

        assert_eq!(combine_results(vec![ok(), ok()]).unwrap(), vec![StopReason::ReachedMaxStep]);
        assert!(matches!(
            combine_results(vec![aborted(), Err(SolverError::NoActiveBlocks { step: 4 })]),
            Err(SolverError::NoActiveBlocks { step: 4 })));
        assert!(matches!(
            combine_results(vec![ok(), aborted()]),
            Err(SolverError::Exchange(ExchangeError::PeerFailed(_)))));
    }
}
