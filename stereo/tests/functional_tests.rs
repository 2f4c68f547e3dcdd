use depthcv_core::{FbsParams, FilterMode, MatcherParams, WlsParams};
use depthcv_stereo::{
    run_post_filter, sgbm::SgbmMatcher, DisparityMatcher, MatcherInput, PostFilterInput,
    DISPARITY_SCALE,
};
use image::GrayImage;

fn pattern(x: u32, y: u32) -> u8 {
    let h = x.wrapping_mul(31).wrapping_add(y.wrapping_mul(17));
    (h.wrapping_mul(2654435761) >> 24) as u8
}

fn shifted_pair(width: u32, height: u32, shift: u32) -> (GrayImage, GrayImage) {
    let left = GrayImage::from_fn(width, height, |x, y| image::Luma([pattern(x, y)]));
    let right = GrayImage::from_fn(width, height, |x, y| image::Luma([pattern(x + shift, y)]));
    (left, right)
}

fn matcher() -> SgbmMatcher {
    let mut params = MatcherParams::default();
    params.speckle_window_size = 0;
    SgbmMatcher::from_params(0, 16, &params, true)
}

#[test]
fn wls_pipeline_keeps_consistent_interior_confident() {
    let (left_img, right_img) = shifted_pair(96, 48, 5);
    let left_input = MatcherInput::from_gray(&left_img);
    let right_input = MatcherInput::from_gray(&right_img);

    let m = matcher();
    let left = m.compute(&left_input, &right_input).unwrap();
    let right = m
        .derive_right_matcher()
        .compute(&right_input, &left_input)
        .unwrap();

    let out = run_post_filter(PostFilterInput {
        mode: FilterMode::Wls,
        left,
        right: Some(right),
        guide_left: left_input,
        guide_right: right_input,
        dual_eye: false,
        block_size: 5,
        wls: WlsParams::default(),
        fbs: FbsParams::default(),
        expected_width: 96,
    });

    let mut confident = 0usize;
    let mut accurate = 0usize;
    let mut total = 0usize;
    for y in 12..36u32 {
        for x in 24..72u32 {
            total += 1;
            if out.left_confidence.get(x, y) > 0.0 {
                confident += 1;
            }
            let v = out.left.get(x, y) as i32;
            if (v - 5 * DISPARITY_SCALE).abs() <= DISPARITY_SCALE {
                accurate += 1;
            }
        }
    }
    assert!(confident * 2 >= total, "interior mostly confident");
    assert!(accurate * 10 >= total * 7, "smoothing kept the disparity");
    // Complementary-matcher path shares the left confidence map.
    assert_eq!(out.right_confidence.data, out.left_confidence.data);
}

#[test]
fn hole_fill_pipeline_leaves_no_gaps_in_textured_rows() {
    let (left_img, right_img) = shifted_pair(96, 48, 3);
    let left_input = MatcherInput::from_gray(&left_img);
    let right_input = MatcherInput::from_gray(&right_img);

    let m = matcher();
    let left = m.compute(&left_input, &right_input).unwrap();

    let out = run_post_filter(PostFilterInput {
        mode: FilterMode::HoleFill,
        left,
        right: None,
        guide_left: left_input,
        guide_right: right_input,
        dual_eye: false,
        block_size: 5,
        wls: WlsParams::default(),
        fbs: FbsParams::default(),
        expected_width: 96,
    });

    let invalid = out.left.invalid_value();
    for y in 0..48u32 {
        let row_has_valid = (0..96u32).any(|x| out.left.get(x, y) != invalid);
        if !row_has_valid {
            continue;
        }
        // A row with at least one valid disparity must be fully closed.
        let gaps = (0..96u32)
            .filter(|&x| out.left.get(x, y) == invalid)
            .count();
        assert_eq!(gaps, 0, "row {y} still has holes");
    }
}

#[test]
fn wls_fbs_pipeline_stays_in_disparity_range() {
    let (left_img, right_img) = shifted_pair(96, 48, 6);
    let left_input = MatcherInput::from_gray(&left_img);
    let right_input = MatcherInput::from_gray(&right_img);

    let m = matcher();
    let left = m.compute(&left_input, &right_input).unwrap();
    let right = m
        .derive_right_matcher()
        .compute(&right_input, &left_input)
        .unwrap();

    let out = run_post_filter(PostFilterInput {
        mode: FilterMode::WlsFbs,
        left,
        right: Some(right),
        guide_left: left_input,
        guide_right: right_input,
        dual_eye: false,
        block_size: 5,
        wls: WlsParams::default(),
        fbs: FbsParams::default(),
        expected_width: 96,
    });

    for &v in &out.left.data {
        assert!((v as i32) >= 0 && (v as i32) <= 16 * DISPARITY_SCALE);
    }
}
