use crate::block::{BlockData, NUM_GHOST};
use crate::error::BcError;
use crate::geometry::Face;
use crate::state::FlowState;
use super::BoundaryCondition;




/// Zero-order extrapolation: every ghost layer takes the state of the
/// interior cell touching the face.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtrapolateOut;

impl BoundaryCondition for ExtrapolateOut {
    fn name(&self) -> &str {
        "extrapolate_out"
    }

    fn apply_inviscid(&mut self, data: &mut BlockData, face: Face, _t: f64) -> Result<(), BcError> {
        let inner = data.face_layer(face, 0, false);

        for d in 0..NUM_GHOST {
            let ghost = data.face_layer(face, d, true);

            for (src, dst) in inner.iter().zip(ghost) {
                data.copy_flow_state(*src, dst);
            }
        }
        Ok(())
    }
}




/// A fixed inflow state imposed on every ghost layer.
///
#[derive(Clone, Debug)]
pub struct SupersonicIn {
    pub fs: FlowState,
}

impl SupersonicIn {
    pub fn new(fs: FlowState) -> Self {
        Self { fs }
    }
}

impl BoundaryCondition for SupersonicIn {
    fn name(&self) -> &str {
        "supersonic_in"
    }

    fn apply_inviscid(&mut self, data: &mut BlockData, face: Face, _t: f64) -> Result<(), BcError> {
        for d in 0..NUM_GHOST {
            for n in data.face_layer(face, d, true) {
                data.cells[n].fs.copy_values_from(&self.fs);
            }
        }
        Ok(())
    }
}
