use rayon::prelude::*;
use crate::block::Block;
use crate::error::GasError;
use crate::physics::RadiationTransport;




/// Largest tolerated drift of the emission factor since the last full
/// radiation computation, when that check is enabled.
///
pub const RADIATION_SCALING_LIMIT: f64 = 1e6;




/// Either recompute the radiative source of every active cell, or rescale
/// the last computed source from the current temperature. A full
/// computation happens when `frequency` is non-zero and divides `step`.
/// Returns whether the source was recomputed.
///
pub fn radiation_gate(
    rt: &mut dyn RadiationTransport,
    blocks: &mut [Block],
    step: usize,
    frequency: usize) -> Result<bool, GasError>
{
    if frequency == 0 || step % frequency != 0 {
        for block in blocks.iter_mut().filter(|b| b.active) {
            block.data.cells.par_iter_mut().filter(|c| !c.ghost).for_each(|c| c.rescale_q_rad());
        }
        return Ok(false);
    }
    rt.compute_q_rad_for_flowfield(blocks)?;

    for block in blocks.iter_mut().filter(|b| b.active) {
        block.data.cells.par_iter_mut().filter(|c| !c.ghost).for_each(|c| c.store_rad_scaling_params());
    }
    Ok(true)
}

/// The largest emission-factor drift over the active cells.
///
pub fn max_scaling_ratio(blocks: &[Block]) -> f64 {
    blocks
        .iter()
        .filter(|b| b.active)
        .flat_map(|b| b.data.interior_cells().map(|c| c.rad_scaling_ratio()))
        .fold(0.0, f64::max)
}




#[cfg(test)]
mod test {

    use super::*;
    use crate::block::BlockMesh;
    use crate::gas::IdealGas;
    use crate::geometry::Vector3d;
    use crate::physics::OpticallyThinEmission;
    use crate::state::FlowState;

    struct Counting {
        inner: OpticallyThinEmission,
        calls: usize,
    }

    impl RadiationTransport for Counting {
        fn compute_q_rad_for_flowfield(&mut self, blocks: &mut [Block]) -> Result<(), GasError> {
            self.calls += 1;
            self.inner.compute_q_rad_for_flowfield(blocks)
        }
    }

    fn blocks(t: f64) -> Vec<Block> {
        let gm = IdealGas::default();
        let mesh = BlockMesh { origin: Vector3d::zero(), spacing: Vector3d::new(0.1, 0.1, 1.0) };
        let mut b = Block::new(0, 2, (2, 2, 1), mesh, &gm);
        b.data.fill(|_| FlowState::from_pvt(&gm, 1.0e5, Vector3d::zero(), t, None).unwrap());
        vec![b]
    }

    #[test]
    fn recomputes_only_on_multiples_of_the_frequency() {
        let mut rt = Counting { inner: OpticallyThinEmission { absorption_coefficient: 1.0 }, calls: 0 };
        let mut blocks = blocks(1000.0);

        let recomputed: Vec<bool> = (0..7).map(|step| radiation_gate(&mut rt, &mut blocks, step, 3).unwrap()).collect();
        assert_eq!(recomputed, vec![true, false, false, true, false, false, true]);
        assert_eq!(rt.calls, 3);
    }

    #[test]
    fn zero_frequency_never_recomputes() {
        let mut rt = Counting { inner: OpticallyThinEmission { absorption_coefficient: 1.0 }, calls: 0 };
        let mut blocks = blocks(1000.0);
        for step in 0..4 {
            assert!(!radiation_gate(&mut rt, &mut blocks, step, 0).unwrap());
        }
        assert_eq!(rt.calls, 0);
    }

    #[test]
    fn rescaled_source_follows_temperature() {
        let gm = IdealGas::default();
        let mut rt = OpticallyThinEmission { absorption_coefficient: 1.0 };
        let mut blocks = blocks(1000.0);
        radiation_gate(&mut rt, &mut blocks, 0, 10).unwrap();
        let q0 = blocks[0].data.cell((0, 0, 0)).q_rad;

        blocks[0].data.fill(|_| FlowState::from_pvt(&gm, 1.0e5, Vector3d::zero(), 2000.0, None).unwrap());
        radiation_gate(&mut rt, &mut blocks, 1, 10).unwrap();
        let q1 = blocks[0].data.cell((0, 0, 0)).q_rad;
        assert!((q1 / q0 - 16.0).abs() < 1e-9);
        assert!((max_scaling_ratio(&blocks) - 15.0).abs() < 1e-9);
        assert!(max_scaling_ratio(&blocks) < RADIATION_SCALING_LIMIT);
    }
}
