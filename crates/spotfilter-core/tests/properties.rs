use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spotfilter_core::boundary::pad_replicate;
use spotfilter_core::{
    build_bandpass, build_radial_profile, build_tophat, convolve_at_points, convolve_dense,
    validate, CancelToken, Coord, FilterError, Kernel,
};

#[test]
fn bandpass_kernels_sum_to_zero_with_odd_extents() {
    for r1 in 1..=5 {
        for r2 in r1..=2 * r1 + 2 {
            let profile = build_radial_profile(r1, r2).unwrap();
            assert_eq!(profile.sum(), 0, "profile r1={r1} r2={r2}");
            assert_eq!(profile.len(), 2 * r2 + 1);
            for is_3d in [false, true] {
                if is_3d && r2 > 6 {
                    continue;
                }
                let k = build_bandpass(r1, r2, is_3d).unwrap();
                assert_eq!(k.sum(), 0, "kernel r1={r1} r2={r2} 3d={is_3d}");
                assert!(k.shape().iter().all(|e| e % 2 == 1));
            }
        }
    }
}

#[test]
fn tophat_extents_are_odd() {
    for r in 1..8 {
        let k = build_tophat(r).unwrap();
        assert_eq!(k.shape(), [2 * r + 1, 2 * r + 1, 1]);
    }
}

#[test]
fn sparse_matches_dense_on_random_volumes() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for round in 0..6 {
        let is_3d = round % 2 == 1;
        let (ny, nx, nz) = (rng.gen_range(3..9), rng.gen_range(3..9), if is_3d { rng.gen_range(2..5) } else { 1 });
        let volume = Array3::from_shape_fn((ny, nx, nz), |_| rng.gen_range(-1i8..=1));
        let r1 = rng.gen_range(1..3);
        let kernel = build_bandpass(r1, 2 * r1, is_3d).unwrap();

        let dense = convolve_dense(volume.view(), &kernel, &CancelToken::new()).unwrap();

        let half = kernel.half_extent();
        let padded = pad_replicate(volume.view(), half).unwrap();
        let coords: Vec<Coord> = (0..20)
            .map(|_| {
                [
                    rng.gen_range(0..ny) + half[0],
                    rng.gen_range(0..nx) + half[1],
                    rng.gen_range(0..nz) + half[2],
                ]
            })
            .collect();
        let sparse = convolve_at_points(padded.view(), &kernel, &coords, None).unwrap();
        for (c, r) in coords.iter().zip(&sparse.primary) {
            let logical = [c[0] - half[0], c[1] - half[1], c[2] - half[2]];
            assert_eq!(dense[logical], *r, "round {round} at {logical:?}");
        }
    }
}

#[test]
fn uniform_interior_gives_zero_response() {
    let mut rng = StdRng::seed_from_u64(7);
    let kernel = build_bandpass(2, 4, false).unwrap();
    // random border, constant 9x9 core
    let mut volume = Array3::from_shape_fn((17, 17, 1), |_| rng.gen_range(0u16..1000));
    for y in 4..13 {
        for x in 4..13 {
            volume[[y, x, 0]] = 421;
        }
    }
    let r = convolve_at_points(volume.view(), &kernel, &[[8, 8, 0]], None).unwrap();
    assert_eq!(r.primary, vec![0]);
}

#[test]
fn constant_five_by_five_scenario() {
    let volume = Array3::<i32>::from_elem((5, 5, 1), 10);
    let weights = Array3::from_shape_fn((3, 3, 1), |(y, x, _)| match (y, x) {
        (1, 1) => 4,
        (0, 1) | (1, 0) | (1, 2) | (2, 1) => -1,
        _ => 0,
    });
    let kernel = Kernel::new(weights, 1.0).unwrap();
    validate([5, 5, 1], [1, 1, 0], kernel.shape()).unwrap();
    let r = convolve_at_points(volume.view(), &kernel, &[[2, 2, 0]], None).unwrap();
    assert_eq!(r.primary, vec![0]);
}

#[test]
fn dual_volume_returns_two_arrays_of_point_count() {
    let a = Array3::<i8>::from_elem((7, 7, 1), 1);
    let b = Array3::<i8>::from_elem((7, 7, 1), -1);
    let kernel = build_bandpass(1, 2, false).unwrap();
    let coords = [[2, 2, 0], [3, 3, 0], [4, 2, 0]];
    let r = convolve_at_points(a.view(), &kernel, &coords, Some(b.view())).unwrap();
    assert_eq!(r.primary.len(), coords.len());
    assert_eq!(r.secondary.map(|s| s.len()), Some(coords.len()));
}

#[test]
fn edge_coordinate_without_padding_is_out_of_bounds() {
    let volume = Array3::<i8>::zeros((5, 5, 1));
    let kernel = build_tophat(1).unwrap();
    assert!(matches!(
        validate([5, 5, 1], [0, 0, 0], kernel.shape()),
        Err(FilterError::Padding { .. })
    ));
    let err = convolve_at_points(volume.view(), &kernel, &[[0, 0, 0]], None).unwrap_err();
    assert!(matches!(err, FilterError::Bounds { coord: [0, 0, 0], .. }));
}

#[test]
fn point_partitioning_does_not_change_results() {
    let mut rng = StdRng::seed_from_u64(42);
    let volume = Array3::from_shape_fn((12, 12, 5), |_| rng.gen_range(-1i8..=1));
    let kernel = build_bandpass(1, 2, true).unwrap();
    let coords: Vec<Coord> = (0..64)
        .map(|_| [rng.gen_range(2..10), rng.gen_range(2..10), 2])
        .collect();

    let whole = convolve_at_points(volume.view(), &kernel, &coords, None).unwrap().primary;
    let mut pieces = Vec::new();
    for chunk in coords.chunks(5) {
        pieces.extend(convolve_at_points(volume.view(), &kernel, chunk, None).unwrap().primary);
    }
    assert_eq!(whole, pieces);
}
