use serde::{Deserialize, Serialize};
use crate::geometry::Axis;
use crate::state::{ConservedQuantities, FlowState};




/**
 * Choice of approximate Riemann solver at cell interfaces. The adaptive
 * choice uses the dissipative Rusanov flux next to cells flagged as
 * shock-adjacent and HLLE everywhere else.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FluxCalculator {
    Hlle,
    Rusanov,
    Adaptive,
}




/**
 * Scratch storage for the interface flux loop, so the per-interface work does
 * not allocate.
 */
#[derive(Clone, Debug, Default)]
pub struct FluxWorkspace {
    ul: ConservedQuantities,
    ur: ConservedQuantities,
    fl: ConservedQuantities,
    fr: ConservedQuantities,
}




// ============================================================================
impl FluxWorkspace {
    pub fn new(num_species: usize, num_modes: usize) -> Self {
        let z = ConservedQuantities::new(num_species, num_modes);
        Self { ul: z.clone(), ur: z.clone(), fl: z.clone(), fr: z }
    }
}




// ============================================================================
fn physical_flux(fs: &FlowState, u: &ConservedQuantities, axis: Axis, wn: f64, f: &mut ConservedQuantities) {
    let vn = fs.vel.component(axis);
    let p = fs.gas.p;
    f.clear();
    f.add_scaled(vn - wn, u);
    f.momentum += axis.unit() * p;
    f.total_energy += p * vn;
}




/**
 * The HLLE flux between two states, across an interface normal to `axis`
 * moving with normal velocity `wn`.
 */
pub fn riemann_hlle(
    pl: &FlowState,
    pr: &FlowState,
    axis: Axis,
    wn: f64,
    ws: &mut FluxWorkspace,
    out: &mut ConservedQuantities)
{
    ws.ul.encode(pl);
    ws.ur.encode(pr);
    physical_flux(pl, &ws.ul, axis, wn, &mut ws.fl);
    physical_flux(pr, &ws.ur, axis, wn, &mut ws.fr);

    let vl = pl.vel.component(axis) - wn;
    let vr = pr.vel.component(axis) - wn;
    let ap = (vl + pl.gas.a).max(vr + pr.gas.a).max(0.0);
    let am = (vl - pl.gas.a).min(vr - pr.gas.a).min(0.0);

    out.clear();

    if ap - am <= 0.0 {
        out.add_scaled(0.5, &ws.fl);
        out.add_scaled(0.5, &ws.fr);
        return;
    }
    let c = 1.0 / (ap - am);
    out.add_scaled(ap * c, &ws.fl);
    out.add_scaled(-am * c, &ws.fr);
    out.add_scaled(ap * am * c, &ws.ur);
    out.add_scaled(-ap * am * c, &ws.ul);
}




/**
 * The local Lax-Friedrichs (Rusanov) flux between two states.
 */
pub fn riemann_rusanov(
    pl: &FlowState,
    pr: &FlowState,
    axis: Axis,
    wn: f64,
    ws: &mut FluxWorkspace,
    out: &mut ConservedQuantities)
{
    ws.ul.encode(pl);
    ws.ur.encode(pr);
    physical_flux(pl, &ws.ul, axis, wn, &mut ws.fl);
    physical_flux(pr, &ws.ur, axis, wn, &mut ws.fr);

    let sl = (pl.vel.component(axis) - wn).abs() + pl.gas.a;
    let sr = (pr.vel.component(axis) - wn).abs() + pr.gas.a;
    let s = sl.max(sr);

    out.clear();
    out.add_scaled(0.5, &ws.fl);
    out.add_scaled(0.5, &ws.fr);
    out.add_scaled(-0.5 * s, &ws.ur);
    out.add_scaled(0.5 * s, &ws.ul);
}




/**
 * Thin-layer viscous flux across an interface normal to `axis`, from the
 * states on either side and the distance between them. Only gradients normal
 * to the interface are retained. The result is scaled by `factor` and has the
 * same sign convention as the inviscid flux (it is subtracted from the cell
 * on the low side).
 */
pub fn viscous_flux(
    left: &FlowState,
    right: &FlowState,
    axis: Axis,
    distance: f64,
    factor: f64,
    out: &mut ConservedQuantities)
{
    out.clear();

    if factor == 0.0 || !(distance > 0.0) {
        return;
    }
    let mu = 0.5 * (left.gas.mu + right.gas.mu + left.mu_t + right.mu_t);
    let k = 0.5 * (left.gas.k + right.gas.k + left.k_t + right.k_t);
    let dvdn = (right.vel - left.vel) * (1.0 / distance);
    let dtdn = (right.gas.temperature() - left.gas.temperature()) / distance;
    let vel = (left.vel + right.vel) * 0.5;

    let tau = dvdn * mu + axis.unit() * (mu / 3.0 * dvdn.component(axis));
    out.momentum = -tau * factor;
    out.total_energy = -(tau.dot(&vel) + k * dtdn) * factor;
}
