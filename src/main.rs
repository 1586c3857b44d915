/*

Notes:
    Cell size of the spatial grid is the kernel support radius, so the 27 cell
    neighborhood always covers the full kernel.

    Fracture is evaluated between steps on the clock thread. Voronoi cells are
    clipped against the body one bisector plane at a time (O(n^2) in the seed count,
    fine for the 4..40 seeds we use).

TODO:
    Two-way coupling between fragments and fluid (fragments are only boundary-aware).
*/

fn main() {
    sph_fracture::start();
}
