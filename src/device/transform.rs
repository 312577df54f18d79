//! Output frame transform
//!
//! Each sensing point owns four consecutive sensor channels. The first two
//! are rotated by [`ROTATION`] into the published x/y plane, the last two sum
//! to z.

use std::f64::consts::FRAC_PI_4;

use super::report::{DecodedSample, SENSOR_CHANNELS};

/// Number of sensing points on the device
pub const SENSING_POINTS: usize = 5;

/// Length of one published vector, an `(x, y, z)` triple per sensing point
pub const OUTPUT_LEN: usize = SENSING_POINTS * 3;

/// Rotation applied to each sensing point's planar pair
pub const ROTATION: f64 = FRAC_PI_4;

pub type OutputVector = [f64; OUTPUT_LEN];

const CHANNELS_PER_POINT: usize = SENSOR_CHANNELS / SENSING_POINTS;

/// Fixed linear transform from device channels to the published frame.
///
/// The sine and cosine are evaluated once here so the poll loop only does
/// multiply-adds. A reader keeps one instance for its whole lifetime, so the
/// angle cannot drift between samples.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HandTransform {
    sin: f64,
    cos: f64,
}

impl Default for HandTransform {
    fn default() -> Self {
        Self::with_angle(ROTATION)
    }
}

impl HandTransform {
    fn with_angle(angle: f64) -> Self {
        let (sin, cos) = angle.sin_cos();
        Self { sin, cos }
    }

    /// Writes the transformed sample into `out`
    pub fn apply_into(&self, sample: &DecodedSample, out: &mut OutputVector) {
        let channels = sample.sensor_channels();
        for (point, chunk) in channels.chunks_exact(CHANNELS_PER_POINT).enumerate() {
            let (a, b) = (chunk[0], chunk[1]);
            out[point * 3] = a * self.cos - b * self.sin;
            out[point * 3 + 1] = a * self.sin + b * self.cos;
            out[point * 3 + 2] = chunk[2] + chunk[3];
        }
    }

    pub fn apply(&self, sample: &DecodedSample) -> OutputVector {
        let mut out = [f64::NAN; OUTPUT_LEN];
        self.apply_into(sample, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::report::CHANNEL_COUNT;
    use proptest::prelude::*;

    fn sample_from(channels: [f64; CHANNEL_COUNT]) -> DecodedSample {
        DecodedSample {
            device_time: 0.0,
            channels,
        }
    }

    #[test]
    fn saturated_channels_map_to_known_triple() {
        let out = HandTransform::default().apply(&sample_from([1.0; CHANNEL_COUNT]));

        for point in 0..SENSING_POINTS {
            assert!(out[point * 3].abs() < 1e-12, "x = {}", out[point * 3]);
            assert!((out[point * 3 + 1] - std::f64::consts::SQRT_2).abs() < 1e-12);
            assert_eq!(out[point * 3 + 2], 2.0);
        }
    }

    #[test]
    fn status_channel_is_not_consumed() {
        let mut channels = [0.0; CHANNEL_COUNT];
        channels[0] = 1.0;
        let out = HandTransform::default().apply(&sample_from(channels));
        assert!(out.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn every_output_slot_is_written() {
        let out = HandTransform::default().apply(&sample_from([0.25; CHANNEL_COUNT]));
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn points_use_consecutive_channel_groups() {
        let mut channels = [0.0; CHANNEL_COUNT];
        // point 2 reads channels 9..=12
        channels[11] = 0.5;
        channels[12] = 0.25;
        let out = HandTransform::default().apply(&sample_from(channels));
        assert_eq!(out[8], 0.75);
        assert_eq!(out[2], 0.0);
        assert_eq!(out[14], 0.0);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(256))]

        #[test]
        fn prop_rotation_preserves_magnitude(channels in proptest::array::uniform21(0.0f64..=1.0)) {
            let sample = sample_from(channels);
            let out = HandTransform::default().apply(&sample);
            let c = sample.sensor_channels();
            for point in 0..SENSING_POINTS {
                let (x, y) = (out[point * 3], out[point * 3 + 1]);
                let (c0, c1) = (c[point * 4], c[point * 4 + 1]);
                let diff = (x * x + y * y) - (c0 * c0 + c1 * c1);
                prop_assert!(diff.abs() < 1e-12, "magnitude drift {}", diff);
            }
        }

        #[test]
        fn prop_z_is_exact_channel_sum(channels in proptest::array::uniform21(0.0f64..=1.0)) {
            let sample = sample_from(channels);
            let out = HandTransform::default().apply(&sample);
            let c = sample.sensor_channels();
            for point in 0..SENSING_POINTS {
                prop_assert_eq!(out[point * 3 + 2], c[point * 4 + 2] + c[point * 4 + 3]);
            }
        }
    }
}
