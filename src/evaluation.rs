use crate::dataset::MAX_GRASP_WIDTH;
use crate::grasp::{detect_grasps, GraspRectangles};
use crate::imaging::gaussian_filter;

/// IoU a detected grasp must exceed against some ground-truth rectangle.
pub const IOU_MATCH_THRESHOLD: f64 = 0.25;

/// Smoothed quality, angle and width maps for one image.
#[derive(Clone, Debug)]
pub struct GraspOutput {
    pub shape: (usize, usize),
    pub quality: Vec<f32>,
    pub angle: Vec<f32>,
    pub width: Vec<f32>,
}

/// Turns raw network maps into a quality map, grasp angle
/// `atan2(sin, cos) / 2` and width in pixels, each Gaussian-smoothed.
pub fn post_process_output(
    position: &[f32],
    cos: &[f32],
    sin: &[f32],
    width: &[f32],
    shape: (usize, usize),
) -> GraspOutput {
    let (h, w) = shape;
    let angle: Vec<f32> = sin
        .iter()
        .zip(cos)
        .map(|(s, c)| s.atan2(*c) / 2.0)
        .collect();
    let width: Vec<f32> = width.iter().map(|v| v * MAX_GRASP_WIDTH).collect();

    GraspOutput {
        shape,
        quality: gaussian_filter(position, h, w, 2.0),
        angle: gaussian_filter(&angle, h, w, 2.0),
        width: gaussian_filter(&width, h, w, 1.0),
    }
}

/// Whether any of the `no_grasps` best detections overlaps a ground-truth
/// rectangle with IoU above `IOU_MATCH_THRESHOLD`.
pub fn calculate_iou_match(
    output: &GraspOutput,
    ground_truth: &GraspRectangles,
    no_grasps: usize,
) -> bool {
    detect_grasps(
        &output.quality,
        &output.angle,
        &output.width,
        output.shape,
        no_grasps,
    )
    .iter()
    .any(|g| g.max_iou(ground_truth) > IOU_MATCH_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grasp::Grasp;

    fn synthetic_output(center: (usize, usize), angle: f32, width_px: f32) -> GraspOutput {
        let shape = (80, 80);
        let mut position = vec![0.0f32; 80 * 80];
        for r in center.0 - 3..=center.0 + 3 {
            for c in center.1 - 3..=center.1 + 3 {
                position[r * 80 + c] = 1.0;
            }
        }
        let cos = vec![(2.0 * angle).cos(); 80 * 80];
        let sin = vec![(2.0 * angle).sin(); 80 * 80];
        let width = vec![width_px / MAX_GRASP_WIDTH; 80 * 80];
        post_process_output(&position, &cos, &sin, &width, shape)
    }

    #[test]
    fn post_processing_recovers_angle_and_width() {
        let out = synthetic_output((40, 40), 0.3, 30.0);
        let idx = 40 * 80 + 40;
        assert!((out.angle[idx] - 0.3).abs() < 1e-4);
        assert!((out.width[idx] - 30.0).abs() < 1e-3);
        assert!(out.quality[idx] > 0.2);
    }

    #[test]
    fn matching_grasp_counts_as_correct() {
        let out = synthetic_output((40, 40), 0.0, 30.0);
        let gt = GraspRectangles {
            rects: vec![Grasp {
                center: [40.0, 40.0],
                angle: 0.0,
                length: 30.0,
                width: 15.0,
            }
            .as_rectangle()],
        };
        assert!(calculate_iou_match(&out, &gt, 1));
    }

    #[test]
    fn distant_or_rotated_grasp_fails() {
        let out = synthetic_output((40, 40), 0.0, 30.0);
        let far = GraspRectangles {
            rects: vec![Grasp {
                center: [40.0, 70.0],
                angle: 0.0,
                length: 10.0,
                width: 5.0,
            }
            .as_rectangle()],
        };
        assert!(!calculate_iou_match(&out, &far, 1));

        let rotated = GraspRectangles {
            rects: vec![Grasp {
                center: [40.0, 40.0],
                angle: std::f64::consts::FRAC_PI_2,
                length: 30.0,
                width: 15.0,
            }
            .as_rectangle()],
        };
        assert!(!calculate_iou_match(&out, &rotated, 1));
    }

    #[test]
    fn empty_quality_map_never_matches() {
        let shape = (64, 64);
        let zeros = vec![0.0f32; 64 * 64];
        let out = post_process_output(&zeros, &zeros, &zeros, &zeros, shape);
        let gt = GraspRectangles {
            rects: vec![Grasp {
                center: [32.0, 32.0],
                angle: 0.0,
                length: 20.0,
                width: 10.0,
            }
            .as_rectangle()],
        };
        assert!(!calculate_iou_match(&out, &gt, 1));
    }
}
