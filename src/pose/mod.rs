//! Classification and bit packing of tracked object poses.
//!
//! High-frequency state is almost never in a truly arbitrary pose: most
//! tracked objects sit flat on the play surface, stand upright on it, or
//! occupy one of a fixed table of anchor slots. Classifying each pose first
//! lets the common cases pack into one or four bytes, with the nine byte
//! encoding reserved for genuinely free poses. The discriminant is always
//! recoverable from the leading tag bits, so packed entries concatenate
//! densely with no per-entry length prefix.
//!
//! Layouts, most significant bit first:
//!
//! - flat:      `1 | face-down bit | 8-bit spin | 11-bit x | 11-bit z`
//! - slot:      `01 | 2-bit seat | 4-bit order`
//! - upright:   `001 | 7-bit yaw | 11-bit x | 11-bit z`
//! - arbitrary: `0001 | 12-bit x | 12-bit y | 12-bit z |` smallest-three quaternion
//!
//! Rotation angles are degrees over `[0, 360)`; planar coordinates span the
//! configured surface range; all quantization clamps, never wraps.

pub mod math;

use std::f32::consts::FRAC_PI_2;

use thiserror::Error;

use crate::serde::{BitReader, BitWriter, SerdeErr};
use math::{Quat, Vec3};

const SPIN_BITS: u32 = 8;
const YAW_BITS: u32 = 7;
const PLANAR_BITS: u32 = 11;
const VOLUME_BITS: u32 = 12;
const QUAT_COMPONENT_BITS: u32 = 10;

/// Errors from pose packing and unpacking
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoseError {
    /// Buffer ended before the variant's fixed size was read
    #[error("packed pose truncated: {0}")]
    Truncated(#[from] SerdeErr),
    /// Leading tag bits match no known variant
    #[error("unknown pose tag")]
    BadTag,
    /// Pose was classified as a slot but matches no configured anchor
    #[error("no slot anchor within tolerance of the pose")]
    NoAnchor,
    /// Packed slot refers to an anchor this codec does not know
    #[error("no anchor configured for seat {seat} order {order}")]
    UnknownSlot { seat: u8, order: u8 },
}

/// Spatial classification of a tracked pose. The packed width is a pure
/// function of the discriminant, which is what makes dense packing work.
///
/// `Dealt` covers objects still in their initial dealt arrangement; that
/// arrangement is transmitted out of band as a bulk payload, so the
/// discriminant packs to zero bytes and is never produced by
/// classification or recovered by unpacking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discriminant {
    Dealt,
    Slot,
    Upright,
    Flat,
    Arbitrary,
}

impl Discriminant {
    pub fn packed_size(self) -> usize {
        match self {
            Discriminant::Dealt => 0,
            Discriminant::Slot => 1,
            Discriminant::Upright | Discriminant::Flat => 4,
            Discriminant::Arbitrary => 9,
        }
    }
}

/// One named anchor pose: an exact position objects snap to, addressed by
/// seat and in-seat order.
#[derive(Debug, Clone)]
pub struct SlotAnchor {
    pub seat: u8,
    pub order: u8,
    pub position: Vec3,
    pub orientation: Quat,
}

/// Geometry of the play space the classifier tests against. Heights and
/// tolerances come from the physical object dimensions; simulation never
/// produces exact values, so every test is an epsilon comparison.
#[derive(Debug, Clone)]
pub struct PoseSpace {
    /// Height of an object's center when lying flat on the surface.
    pub surface_height: f32,
    /// Height of an object's center when standing upright.
    pub standing_height: f32,
    pub height_epsilon: f32,
    /// Minimum vertical component of a local axis for it to count as
    /// vertical.
    pub min_axis_alignment: f32,
    /// Maximum distance from an anchor for a pose to classify as slotted.
    pub slot_epsilon: f32,
    /// Planar coordinate range for flat/upright poses, both axes.
    pub planar_range: (f32, f32),
    /// Full-volume ranges for arbitrary poses.
    pub x_range: (f32, f32),
    pub y_range: (f32, f32),
    pub z_range: (f32, f32),
    pub anchors: Vec<SlotAnchor>,
}

impl Default for PoseSpace {
    fn default() -> Self {
        Self {
            surface_height: 0.016,
            standing_height: 0.025,
            height_epsilon: 1e-3,
            min_axis_alignment: 0.99,
            slot_epsilon: 0.005,
            planar_range: (-1.0, 1.0),
            x_range: (-2.0, 2.0),
            y_range: (0.0, 3.0),
            z_range: (-2.0, 2.0),
            anchors: Vec::new(),
        }
    }
}

/// Packs and unpacks poses against one configured [`PoseSpace`].
pub struct PoseCodec {
    space: PoseSpace,
}

impl PoseCodec {
    pub fn new(space: PoseSpace) -> Self {
        Self { space }
    }

    pub fn space(&self) -> &PoseSpace {
        &self.space
    }

    /// Chooses the densest encoding the pose qualifies for. Anchor matches
    /// win over the geometric tests because slotted objects are also
    /// upright.
    pub fn classify(&self, position: Vec3, orientation: Quat) -> Discriminant {
        if self.nearest_anchor(position).is_some() {
            return Discriminant::Slot;
        }
        let up = orientation.rotate(Vec3::Y);
        let forward = orientation.rotate(Vec3::Z);
        if (position.y - self.space.standing_height).abs() <= self.space.height_epsilon
            && up.y > self.space.min_axis_alignment
        {
            return Discriminant::Upright;
        }
        if (position.y - self.space.surface_height).abs() <= self.space.height_epsilon
            && forward.y.abs() > self.space.min_axis_alignment
        {
            return Discriminant::Flat;
        }
        Discriminant::Arbitrary
    }

    /// Packs a pose into the discriminant's fixed-size encoding.
    pub fn pack(
        &self,
        discriminant: Discriminant,
        position: Vec3,
        orientation: Quat,
    ) -> Result<Vec<u8>, PoseError> {
        let mut writer = BitWriter::new();
        match discriminant {
            Discriminant::Dealt => {}
            Discriminant::Slot => {
                let anchor = self.nearest_anchor(position).ok_or(PoseError::NoAnchor)?;
                writer.write_bit(false);
                writer.write_bit(true);
                writer.write_bits(u32::from(anchor.seat & 0x3), 2);
                writer.write_bits(u32::from(anchor.order & 0xf), 4);
            }
            Discriminant::Upright => {
                let yaw = Self::yaw_degrees(orientation);
                let (min, max) = self.space.planar_range;
                writer.write_bits(0b001, 3);
                writer.write_quantized_f32(yaw, 0.0, 360.0, YAW_BITS);
                writer.write_quantized_f32(position.x, min, max, PLANAR_BITS);
                writer.write_quantized_f32(position.z, min, max, PLANAR_BITS);
            }
            Discriminant::Flat => {
                let face_up = orientation.rotate(Vec3::Z).y > 0.0;
                let spin = Self::spin_degrees(orientation, face_up);
                let (min, max) = self.space.planar_range;
                writer.write_bit(true);
                writer.write_bit(!face_up);
                writer.write_quantized_f32(spin, 0.0, 360.0, SPIN_BITS);
                writer.write_quantized_f32(position.x, min, max, PLANAR_BITS);
                writer.write_quantized_f32(position.z, min, max, PLANAR_BITS);
            }
            Discriminant::Arbitrary => {
                writer.write_bits(0b0001, 4);
                let (xmin, xmax) = self.space.x_range;
                let (ymin, ymax) = self.space.y_range;
                let (zmin, zmax) = self.space.z_range;
                writer.write_quantized_f32(position.x, xmin, xmax, VOLUME_BITS);
                writer.write_quantized_f32(position.y, ymin, ymax, VOLUME_BITS);
                writer.write_quantized_f32(position.z, zmin, zmax, VOLUME_BITS);
                Self::pack_quaternion(orientation, &mut writer);
            }
        }
        let bytes = writer.to_bytes();
        debug_assert_eq!(bytes.len(), discriminant.packed_size());
        Ok(bytes)
    }

    /// Recovers discriminant, position and orientation from the leading tag
    /// bits alone; the exact bit-level inverse of [`pack`](Self::pack).
    pub fn unpack(&self, bytes: &[u8]) -> Result<(Discriminant, Vec3, Quat), PoseError> {
        let mut reader = BitReader::new(bytes);
        if reader.read_bit()? {
            // flat
            let face_up = !reader.read_bit()?;
            let spin = reader.read_quantized_f32(0.0, 360.0, SPIN_BITS)?;
            let (min, max) = self.space.planar_range;
            let x = reader.read_quantized_f32(min, max, PLANAR_BITS)?;
            let z = reader.read_quantized_f32(min, max, PLANAR_BITS)?;
            let position = Vec3::new(x, self.space.surface_height, z);
            return Ok((
                Discriminant::Flat,
                position,
                Self::flat_orientation(face_up, spin),
            ));
        }
        if reader.read_bit()? {
            // slot
            let seat = reader.read_bits(2)? as u8;
            let order = reader.read_bits(4)? as u8;
            let anchor = self
                .space
                .anchors
                .iter()
                .find(|a| a.seat == seat && a.order == order)
                .ok_or(PoseError::UnknownSlot { seat, order })?;
            return Ok((Discriminant::Slot, anchor.position, anchor.orientation));
        }
        if reader.read_bit()? {
            // upright
            let yaw = reader.read_quantized_f32(0.0, 360.0, YAW_BITS)?;
            let (min, max) = self.space.planar_range;
            let x = reader.read_quantized_f32(min, max, PLANAR_BITS)?;
            let z = reader.read_quantized_f32(min, max, PLANAR_BITS)?;
            let position = Vec3::new(x, self.space.standing_height, z);
            return Ok((
                Discriminant::Upright,
                position,
                Self::upright_orientation(yaw),
            ));
        }
        if reader.read_bit()? {
            // arbitrary
            let (xmin, xmax) = self.space.x_range;
            let (ymin, ymax) = self.space.y_range;
            let (zmin, zmax) = self.space.z_range;
            let x = reader.read_quantized_f32(xmin, xmax, VOLUME_BITS)?;
            let y = reader.read_quantized_f32(ymin, ymax, VOLUME_BITS)?;
            let z = reader.read_quantized_f32(zmin, zmax, VOLUME_BITS)?;
            let orientation = Self::unpack_quaternion(&mut reader)?;
            return Ok((Discriminant::Arbitrary, Vec3::new(x, y, z), orientation));
        }
        Err(PoseError::BadTag)
    }

    fn nearest_anchor(&self, position: Vec3) -> Option<&SlotAnchor> {
        self.space
            .anchors
            .iter()
            .filter(|a| a.position.distance(position) <= self.space.slot_epsilon)
            .min_by(|a, b| {
                a.position
                    .distance(position)
                    .total_cmp(&b.position.distance(position))
            })
    }

    /// Orientation of an upright object spun `yaw` degrees about vertical.
    pub fn upright_orientation(yaw_degrees: f32) -> Quat {
        Quat::from_axis_angle(Vec3::Y, yaw_degrees.to_radians())
    }

    /// Orientation of a flat object: local forward pushed straight up (or
    /// down for face-down), then spun about vertical.
    pub fn flat_orientation(face_up: bool, spin_degrees: f32) -> Quat {
        let tip = if face_up { -FRAC_PI_2 } else { FRAC_PI_2 };
        Quat::from_axis_angle(Vec3::Y, spin_degrees.to_radians())
            .mul(Quat::from_axis_angle(Vec3::X, tip))
    }

    fn yaw_degrees(orientation: Quat) -> f32 {
        let forward = orientation.rotate(Vec3::Z);
        forward.x.atan2(forward.z).to_degrees().rem_euclid(360.0)
    }

    fn spin_degrees(orientation: Quat, face_up: bool) -> f32 {
        let up = orientation.rotate(Vec3::Y);
        let spin = if face_up {
            (-up.x).atan2(-up.z)
        } else {
            up.x.atan2(up.z)
        };
        spin.to_degrees().rem_euclid(360.0)
    }

    /// Smallest-three compression: 2 bits name the largest-magnitude
    /// component, the other three are stored relative to it. Dividing by
    /// the signed largest pins the dropped component at exactly 1, so
    /// decode reinstates it as 1 and renormalizes.
    fn pack_quaternion(q: Quat, writer: &mut BitWriter) {
        let components = [q.x, q.y, q.z, q.w];
        let mut largest_index = 0;
        for i in 1..4 {
            if components[i].abs() > components[largest_index].abs() {
                largest_index = i;
            }
        }
        let largest = components[largest_index];
        writer.write_bits(largest_index as u32, 2);
        for (i, component) in components.iter().enumerate() {
            if i != largest_index {
                writer.write_quantized_f32(component / largest, -1.0, 1.0, QUAT_COMPONENT_BITS);
            }
        }
    }

    fn unpack_quaternion(reader: &mut BitReader) -> Result<Quat, SerdeErr> {
        let largest_index = reader.read_bits(2)? as usize;
        let mut components = [1.0f32; 4];
        for i in 0..4 {
            if i != largest_index {
                components[i] = reader.read_quantized_f32(-1.0, 1.0, QUAT_COMPONENT_BITS)?;
            }
        }
        Ok(Quat::new(components[0], components[1], components[2], components[3]).normalized())
    }
}

#[cfg(test)]
mod tests {
    use super::math::{Quat, Vec3};
    use super::{Discriminant, PoseCodec, PoseError, PoseSpace, SlotAnchor};

    fn codec_with_anchors() -> PoseCodec {
        let mut space = PoseSpace::default();
        for seat in 0..4u8 {
            for order in 0..4u8 {
                space.anchors.push(SlotAnchor {
                    seat,
                    order,
                    position: Vec3::new(
                        -0.5 + f32::from(order) * 0.04,
                        0.1,
                        -0.8 + f32::from(seat) * 0.05,
                    ),
                    orientation: PoseCodec::upright_orientation(f32::from(seat) * 90.0),
                });
            }
        }
        PoseCodec::new(space)
    }

    fn quat_agrees(a: Quat, b: Quat, tolerance: f32) {
        // q and -q are the same rotation
        assert!(a.dot(b).abs() > 1.0 - tolerance, "{a:?} vs {b:?}");
    }

    #[test]
    fn classifies_each_variant() {
        let codec = codec_with_anchors();
        let space = codec.space();

        let slotted = codec.space().anchors[5].position;
        assert_eq!(
            codec.classify(slotted, Quat::IDENTITY),
            Discriminant::Slot
        );

        let upright = Vec3::new(0.3, space.standing_height, -0.2);
        assert_eq!(
            codec.classify(upright, PoseCodec::upright_orientation(45.0)),
            Discriminant::Upright
        );

        let flat = Vec3::new(0.3, space.surface_height, -0.2);
        assert_eq!(
            codec.classify(flat, PoseCodec::flat_orientation(true, 120.0)),
            Discriminant::Flat
        );

        let tumbling = Vec3::new(0.4, 0.8, 0.1);
        assert_eq!(
            codec.classify(tumbling, Quat::from_axis_angle(Vec3::X, 0.7)),
            Discriminant::Arbitrary
        );
    }

    #[test]
    fn packed_sizes_follow_discriminant() {
        let codec = codec_with_anchors();
        let anchor = codec.space().anchors[0].position;
        assert_eq!(
            codec.pack(Discriminant::Slot, anchor, Quat::IDENTITY).unwrap().len(),
            1
        );
        let upright = Vec3::new(0.0, codec.space().standing_height, 0.0);
        assert_eq!(
            codec
                .pack(Discriminant::Upright, upright, PoseCodec::upright_orientation(10.0))
                .unwrap()
                .len(),
            4
        );
        let arb = Vec3::new(0.1, 1.0, 0.1);
        assert_eq!(
            codec
                .pack(Discriminant::Arbitrary, arb, Quat::IDENTITY)
                .unwrap()
                .len(),
            9
        );
        assert!(codec
            .pack(Discriminant::Dealt, Vec3::ZERO, Quat::IDENTITY)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn discriminant_recovered_from_leading_bits() {
        let codec = codec_with_anchors();
        let space = codec.space();
        let cases = [
            (Discriminant::Slot, space.anchors[3].position, Quat::IDENTITY),
            (
                Discriminant::Upright,
                Vec3::new(0.2, space.standing_height, 0.4),
                PoseCodec::upright_orientation(200.0),
            ),
            (
                Discriminant::Flat,
                Vec3::new(-0.7, space.surface_height, 0.1),
                PoseCodec::flat_orientation(false, 300.0),
            ),
            (
                Discriminant::Arbitrary,
                Vec3::new(1.5, 2.0, -1.0),
                Quat::from_axis_angle(Vec3::new(0.6, 0.8, 0.0), 1.2),
            ),
        ];
        for (discriminant, position, orientation) in cases {
            let packed = codec.pack(discriminant, position, orientation).unwrap();
            let (out, _, _) = codec.unpack(&packed).unwrap();
            assert_eq!(out, discriminant);
        }
    }

    #[test]
    fn upright_round_trip_within_quantization_error() {
        let codec = codec_with_anchors();
        let position = Vec3::new(0.123, codec.space().standing_height, -0.456);
        let orientation = PoseCodec::upright_orientation(77.0);
        let packed = codec.pack(Discriminant::Upright, position, orientation).unwrap();
        let (_, out_pos, out_rot) = codec.unpack(&packed).unwrap();

        let planar_step = 2.0 / ((1 << 11) - 1) as f32;
        assert!((out_pos.x - position.x).abs() <= planar_step);
        assert!((out_pos.z - position.z).abs() <= planar_step);
        assert_eq!(out_pos.y, codec.space().standing_height);
        quat_agrees(out_rot, orientation, 2e-3);
    }

    #[test]
    fn flat_round_trip_keeps_face_and_spin() {
        let codec = codec_with_anchors();
        let position = Vec3::new(-0.25, codec.space().surface_height, 0.75);
        for face_up in [true, false] {
            let orientation = PoseCodec::flat_orientation(face_up, 211.0);
            let packed = codec.pack(Discriminant::Flat, position, orientation).unwrap();
            let (_, out_pos, out_rot) = codec.unpack(&packed).unwrap();
            assert_eq!(out_pos.y, codec.space().surface_height);
            assert_eq!(out_rot.rotate(Vec3::Z).y > 0.0, face_up);
            quat_agrees(out_rot, orientation, 5e-3);
        }
    }

    #[test]
    fn arbitrary_round_trip_within_quantization_error() {
        let codec = codec_with_anchors();
        let position = Vec3::new(-1.234, 0.876, 1.999);
        let orientation = Quat::from_axis_angle(
            Vec3::new(0.267, 0.535, 0.802),
            2.1,
        );
        let packed = codec
            .pack(Discriminant::Arbitrary, position, orientation)
            .unwrap();
        let (_, out_pos, out_rot) = codec.unpack(&packed).unwrap();

        let x_step = 4.0 / ((1 << 12) - 1) as f32;
        let y_step = 3.0 / ((1 << 12) - 1) as f32;
        assert!((out_pos.x - position.x).abs() <= x_step);
        assert!((out_pos.y - position.y).abs() <= y_step);
        assert!((out_pos.z - position.z).abs() <= x_step);
        quat_agrees(out_rot, orientation, 1e-3);
    }

    #[test]
    fn out_of_range_positions_clamp() {
        let codec = codec_with_anchors();
        let position = Vec3::new(10.0, -5.0, 10.0);
        let packed = codec
            .pack(Discriminant::Arbitrary, position, Quat::IDENTITY)
            .unwrap();
        let (_, out_pos, _) = codec.unpack(&packed).unwrap();
        assert!((out_pos.x - 2.0).abs() < 1e-5);
        assert!((out_pos.y - 0.0).abs() < 1e-5);
        assert!((out_pos.z - 2.0).abs() < 1e-5);
    }

    #[test]
    fn slot_round_trip_restores_anchor_pose() {
        let codec = codec_with_anchors();
        let anchor = codec.space().anchors[9].clone();
        let packed = codec
            .pack(Discriminant::Slot, anchor.position, anchor.orientation)
            .unwrap();
        let (discriminant, position, orientation) = codec.unpack(&packed).unwrap();
        assert_eq!(discriminant, Discriminant::Slot);
        assert_eq!(position, anchor.position);
        quat_agrees(orientation, anchor.orientation, 1e-6);
    }

    #[test]
    fn slot_pack_requires_anchor_match() {
        let codec = codec_with_anchors();
        let nowhere = Vec3::new(0.9, 0.9, 0.9);
        assert_eq!(
            codec.pack(Discriminant::Slot, nowhere, Quat::IDENTITY),
            Err(PoseError::NoAnchor)
        );
    }

    #[test]
    fn unpack_rejects_empty_and_unknown_tags() {
        let codec = codec_with_anchors();
        assert!(matches!(
            codec.unpack(&[]),
            Err(PoseError::Truncated(_))
        ));
        assert_eq!(codec.unpack(&[0x00]).unwrap_err(), PoseError::BadTag);
    }
}
