//! H.264 / HEVC header rewriting
//!
//! Some encoders emit an SPS without VUI parameters, which several client
//! decoders need for correct color rendering. This module parses the SPS
//! out of the first IDR packet and synthesizes a replacement with a VUI
//! carrying the stream's color signal. Downstream substitutes the byte
//! ranges verbatim before transport, so replacements always cover whole
//! NAL units.

use crate::config::VideoFormat;
use crate::types::{Colorspace, ColorspaceKind, Replacement};

const H264_NAL_SPS: u8 = 7;
const HEVC_NAL_VPS: u8 = 32;
const HEVC_NAL_SPS: u8 = 33;

/// One NAL unit located inside an Annex B stream
struct Nal<'a> {
    /// NAL bytes including the start code
    bytes: &'a [u8],
    start_code_len: usize,
    header_len: usize,
}

impl<'a> Nal<'a> {
    fn payload(&self) -> &'a [u8] {
        &self.bytes[self.start_code_len + self.header_len..]
    }

    fn header(&self) -> &'a [u8] {
        &self.bytes[self.start_code_len..self.start_code_len + self.header_len]
    }
}

fn nal_type(data: &[u8], offset: usize, format: VideoFormat) -> Option<u8> {
    let byte = *data.get(offset)?;
    Some(match format {
        VideoFormat::H264 => byte & 0x1f,
        VideoFormat::Hevc => (byte >> 1) & 0x3f,
        VideoFormat::Av1 => return None,
    })
}

/// Locate the first NAL of `wanted` type in an Annex B bitstream
fn find_nal(data: &[u8], format: VideoFormat, wanted: u8) -> Option<Nal<'_>> {
    let header_len = match format {
        VideoFormat::H264 => 1,
        VideoFormat::Hevc => 2,
        VideoFormat::Av1 => return None,
    };

    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                starts.push((i, 3usize));
                i += 3;
                continue;
            }
            if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                starts.push((i, 4usize));
                i += 4;
                continue;
            }
        }
        i += 1;
    }

    for (idx, &(start, sc_len)) in starts.iter().enumerate() {
        if nal_type(data, start + sc_len, format) == Some(wanted) {
            let end = starts
                .get(idx + 1)
                .map(|&(next, _)| next)
                .unwrap_or(data.len());
            return Some(Nal {
                bytes: &data[start..end],
                start_code_len: sc_len,
                header_len,
            });
        }
    }
    None
}

/// Remove emulation prevention bytes (00 00 03 -> 00 00)
fn unescape_rbsp(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    let mut zeros = 0u32;
    let mut i = 0;
    while i < payload.len() {
        let byte = payload[i];
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            i += 1;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
        i += 1;
    }
    out
}

/// Insert emulation prevention bytes
fn escape_rbsp(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + 8);
    let mut zeros = 0u32;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }
        out.push(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    out
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn total_bits(&self) -> usize {
        self.data.len() * 8
    }

    fn bit_at(&self, idx: usize) -> Option<bool> {
        let byte = *self.data.get(idx / 8)?;
        Some((byte >> (7 - (idx % 8))) & 1 == 1)
    }

    fn read_bit(&mut self) -> Option<u32> {
        let bit = self.bit_at(self.pos)?;
        self.pos += 1;
        Some(bit as u32)
    }

    fn read_flag(&mut self) -> Option<bool> {
        Some(self.read_bit()? == 1)
    }

    fn read_bits(&mut self, count: u32) -> Option<u32> {
        debug_assert!(count <= 32);
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()?;
        }
        Some(value)
    }

    fn skip_bits(&mut self, mut count: u32) -> Option<()> {
        while count > 32 {
            self.read_bits(32)?;
            count -= 32;
        }
        self.read_bits(count)?;
        Some(())
    }

    fn read_ue(&mut self) -> Option<u32> {
        let mut zeros = 0u32;
        while self.read_bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return None;
            }
        }
        if zeros == 0 {
            return Some(0);
        }
        let rest = self.read_bits(zeros)?;
        Some((1u32 << zeros) - 1 + rest)
    }

    fn read_se(&mut self) -> Option<i32> {
        let k = self.read_ue()? as i64;
        let value = if k % 2 == 1 { (k + 1) / 2 } else { -(k / 2) };
        Some(value as i32)
    }

    /// Raw bits of [start, end)
    fn bits_between(&self, start: usize, end: usize) -> Option<Vec<bool>> {
        (start..end).map(|idx| self.bit_at(idx)).collect()
    }
}

#[derive(Default)]
struct BitWriter {
    bytes: Vec<u8>,
    /// Bits filled in the trailing byte
    filled: u8,
}

impl BitWriter {
    fn write_bit(&mut self, bit: bool) {
        if self.filled == 0 {
            self.bytes.push(0);
        }
        if bit {
            let last = self.bytes.len() - 1;
            self.bytes[last] |= 1 << (7 - self.filled);
        }
        self.filled = (self.filled + 1) % 8;
    }

    fn write_flag(&mut self, flag: bool) {
        self.write_bit(flag);
    }

    fn write_bits(&mut self, value: u32, count: u32) {
        for i in (0..count).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    fn write_ue(&mut self, value: u32) {
        let coded = value + 1;
        let len = 32 - coded.leading_zeros();
        self.write_bits(0, len - 1);
        self.write_bits(coded, len);
    }

    fn write_bools(&mut self, bits: &[bool]) {
        for &bit in bits {
            self.write_bit(bit);
        }
    }

    /// Append rbsp_trailing_bits and return the byte stream
    fn finish(mut self) -> Vec<u8> {
        self.write_bit(true);
        while self.filled != 0 {
            self.write_bit(false);
        }
        self.bytes
    }
}

/// Advance through an H.264 SPS up to (excluding) vui_parameters_present_flag
fn h264_advance_to_vui(r: &mut BitReader) -> Option<()> {
    let profile_idc = r.read_bits(8)?;
    r.skip_bits(8)?; // constraint flags + reserved
    r.skip_bits(8)?; // level_idc
    r.read_ue()?; // seq_parameter_set_id

    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        let chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            r.read_flag()?; // separate_colour_plane_flag
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.read_flag()?; // qpprime_y_zero_transform_bypass_flag
        if r.read_flag()? {
            // seq_scaling_matrix_present_flag
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.read_flag()? {
                    skip_h264_scaling_list(r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = r.read_ue()?;
    if pic_order_cnt_type == 0 {
        r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        r.read_flag()?; // delta_pic_order_always_zero_flag
        r.read_se()?; // offset_for_non_ref_pic
        r.read_se()?; // offset_for_top_to_bottom_field
        let cycle_len = r.read_ue()?;
        if cycle_len > 255 {
            return None;
        }
        for _ in 0..cycle_len {
            r.read_se()?;
        }
    }

    r.read_ue()?; // max_num_ref_frames
    r.read_flag()?; // gaps_in_frame_num_value_allowed_flag
    r.read_ue()?; // pic_width_in_mbs_minus1
    r.read_ue()?; // pic_height_in_map_units_minus1
    if !r.read_flag()? {
        // frame_mbs_only_flag
        r.read_flag()?; // mb_adaptive_frame_field_flag
    }
    r.read_flag()?; // direct_8x8_inference_flag
    if r.read_flag()? {
        // frame_cropping_flag
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
    }
    Some(())
}

fn skip_h264_scaling_list(r: &mut BitReader, size: u32) -> Option<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        last_scale = if next_scale == 0 { last_scale } else { next_scale };
    }
    Some(())
}

/// Advance through an HEVC SPS up to (excluding) vui_parameters_present_flag
fn hevc_advance_to_vui(r: &mut BitReader) -> Option<()> {
    r.read_bits(4)?; // sps_video_parameter_set_id
    let max_sub_layers_minus1 = r.read_bits(3)?;
    r.read_flag()?; // sps_temporal_id_nesting_flag
    skip_hevc_profile_tier_level(r, max_sub_layers_minus1)?;

    r.read_ue()?; // sps_seq_parameter_set_id
    let chroma_format_idc = r.read_ue()?;
    if chroma_format_idc == 3 {
        r.read_flag()?; // separate_colour_plane_flag
    }
    r.read_ue()?; // pic_width_in_luma_samples
    r.read_ue()?; // pic_height_in_luma_samples
    if r.read_flag()? {
        // conformance_window_flag
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
    }
    r.read_ue()?; // bit_depth_luma_minus8
    r.read_ue()?; // bit_depth_chroma_minus8
    let log2_max_pic_order_cnt_lsb_minus4 = r.read_ue()?;
    if log2_max_pic_order_cnt_lsb_minus4 > 12 {
        return None;
    }

    let sub_layer_ordering_info_present = r.read_flag()?;
    let first = if sub_layer_ordering_info_present {
        0
    } else {
        max_sub_layers_minus1
    };
    for _ in first..=max_sub_layers_minus1 {
        r.read_ue()?; // sps_max_dec_pic_buffering_minus1
        r.read_ue()?; // sps_max_num_reorder_pics
        r.read_ue()?; // sps_max_latency_increase_plus1
    }

    r.read_ue()?; // log2_min_luma_coding_block_size_minus3
    r.read_ue()?; // log2_diff_max_min_luma_coding_block_size
    r.read_ue()?; // log2_min_luma_transform_block_size_minus2
    r.read_ue()?; // log2_diff_max_min_luma_transform_block_size
    r.read_ue()?; // max_transform_hierarchy_depth_inter
    r.read_ue()?; // max_transform_hierarchy_depth_intra

    if r.read_flag()? {
        // scaling_list_enabled_flag
        if r.read_flag()? {
            // sps_scaling_list_data_present_flag
            skip_hevc_scaling_list_data(r)?;
        }
    }

    r.read_flag()?; // amp_enabled_flag
    r.read_flag()?; // sample_adaptive_offset_enabled_flag
    if r.read_flag()? {
        // pcm_enabled_flag
        r.read_bits(4)?;
        r.read_bits(4)?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_flag()?;
    }

    let num_short_term_ref_pic_sets = r.read_ue()?;
    if num_short_term_ref_pic_sets > 64 {
        return None;
    }
    let mut num_delta_pocs = vec![0u32; num_short_term_ref_pic_sets as usize];
    for i in 0..num_short_term_ref_pic_sets as usize {
        num_delta_pocs[i] = skip_hevc_st_ref_pic_set(r, i, &num_delta_pocs)?;
    }

    if r.read_flag()? {
        // long_term_ref_pics_present_flag
        let count = r.read_ue()?;
        if count > 32 {
            return None;
        }
        for _ in 0..count {
            r.read_bits(log2_max_pic_order_cnt_lsb_minus4 + 4)?;
            r.read_flag()?;
        }
    }

    r.read_flag()?; // sps_temporal_mvp_enabled_flag
    r.read_flag()?; // strong_intra_smoothing_enabled_flag
    Some(())
}

fn skip_hevc_profile_tier_level(r: &mut BitReader, max_sub_layers_minus1: u32) -> Option<()> {
    r.skip_bits(88)?; // general profile space/tier/idc/compat/constraints
    r.skip_bits(8)?; // general_level_idc

    let mut profile_present = [false; 8];
    let mut level_present = [false; 8];
    for i in 0..max_sub_layers_minus1 as usize {
        profile_present[i] = r.read_flag()?;
        level_present[i] = r.read_flag()?;
    }
    if max_sub_layers_minus1 > 0 {
        for _ in max_sub_layers_minus1..8 {
            r.read_bits(2)?; // reserved_zero_2bits
        }
    }
    for i in 0..max_sub_layers_minus1 as usize {
        if profile_present[i] {
            r.skip_bits(88)?;
        }
        if level_present[i] {
            r.skip_bits(8)?;
        }
    }
    Some(())
}

fn skip_hevc_scaling_list_data(r: &mut BitReader) -> Option<()> {
    for size_id in 0..4u32 {
        let step = if size_id == 3 { 3 } else { 1 };
        let mut matrix_id = 0u32;
        while matrix_id < 6 {
            if !r.read_flag()? {
                // scaling_list_pred_mode_flag == 0
                r.read_ue()?; // scaling_list_pred_matrix_id_delta
            } else {
                let coef_num = 64u32.min(1 << (4 + (size_id << 1)));
                if size_id > 1 {
                    r.read_se()?; // scaling_list_dc_coef_minus8
                }
                for _ in 0..coef_num {
                    r.read_se()?;
                }
            }
            matrix_id += step;
        }
    }
    Some(())
}

/// Returns the set's NumDeltaPocs for use by later predicted sets
fn skip_hevc_st_ref_pic_set(
    r: &mut BitReader,
    idx: usize,
    num_delta_pocs: &[u32],
) -> Option<u32> {
    let predicted = if idx != 0 { r.read_flag()? } else { false };
    if predicted {
        // Within the SPS the reference is always the previous set
        let ref_num = num_delta_pocs[idx - 1];
        r.read_flag()?; // delta_rps_sign
        r.read_ue()?; // abs_delta_rps_minus1
        let mut kept = 0u32;
        for _ in 0..=ref_num {
            let used = r.read_flag()?;
            let use_delta = if !used { r.read_flag()? } else { true };
            if used || use_delta {
                kept += 1;
            }
        }
        // Upper bound; exact derivation needs the referenced POC deltas,
        // which no later SPS field depends on
        Some(kept)
    } else {
        let num_negative = r.read_ue()?;
        let num_positive = r.read_ue()?;
        if num_negative + num_positive > 64 {
            return None;
        }
        for _ in 0..num_negative + num_positive {
            r.read_ue()?; // delta_poc_minus1
            r.read_flag()?; // used_by_curr_pic_flag
        }
        Some(num_negative + num_positive)
    }
}

/// (colour_primaries, transfer_characteristics, matrix_coeffs) VUI codes
fn vui_color_codes(colorspace: &Colorspace) -> (u32, u32, u32) {
    match colorspace.kind {
        ColorspaceKind::Rec601 => (6, 6, 6),
        ColorspaceKind::Rec709 => (1, 1, 1),
        ColorspaceKind::Bt2020Sdr => (9, 14, 9),
        ColorspaceKind::Bt2020Pq => (9, 16, 9),
    }
}

fn write_h264_vui(w: &mut BitWriter, colorspace: &Colorspace) {
    let (primaries, transfer, matrix) = vui_color_codes(colorspace);
    w.write_flag(false); // aspect_ratio_info_present_flag
    w.write_flag(false); // overscan_info_present_flag
    w.write_flag(true); // video_signal_type_present_flag
    w.write_bits(5, 3); // video_format: unspecified
    w.write_flag(colorspace.full_range);
    w.write_flag(true); // colour_description_present_flag
    w.write_bits(primaries, 8);
    w.write_bits(transfer, 8);
    w.write_bits(matrix, 8);
    w.write_flag(false); // chroma_loc_info_present_flag
    w.write_flag(false); // timing_info_present_flag
    w.write_flag(false); // nal_hrd_parameters_present_flag
    w.write_flag(false); // vcl_hrd_parameters_present_flag
    w.write_flag(false); // pic_struct_present_flag
    w.write_flag(false); // bitstream_restriction_flag
}

fn write_hevc_vui(w: &mut BitWriter, colorspace: &Colorspace) {
    let (primaries, transfer, matrix) = vui_color_codes(colorspace);
    w.write_flag(false); // aspect_ratio_info_present_flag
    w.write_flag(false); // overscan_info_present_flag
    w.write_flag(true); // video_signal_type_present_flag
    w.write_bits(5, 3); // video_format: unspecified
    w.write_flag(colorspace.full_range);
    w.write_flag(true); // colour_description_present_flag
    w.write_bits(primaries, 8);
    w.write_bits(transfer, 8);
    w.write_bits(matrix, 8);
    w.write_flag(false); // chroma_loc_info_present_flag
    w.write_flag(false); // neutral_chroma_indication_flag
    w.write_flag(false); // field_seq_flag
    w.write_flag(false); // frame_field_info_present_flag
    w.write_flag(false); // default_display_window_flag
    w.write_flag(false); // vui_timing_info_present_flag
    w.write_flag(false); // bitstream_restriction_flag
}

/// Does the first SPS in `packet` carry VUI parameters?
pub fn validate_sps(packet: &[u8], format: VideoFormat) -> bool {
    let wanted = match format {
        VideoFormat::H264 => H264_NAL_SPS,
        VideoFormat::Hevc => HEVC_NAL_SPS,
        VideoFormat::Av1 => return false,
    };
    let Some(nal) = find_nal(packet, format, wanted) else {
        return false;
    };
    let rbsp = unescape_rbsp(nal.payload());
    let mut reader = BitReader::new(&rbsp);

    let advanced = match format {
        VideoFormat::H264 => h264_advance_to_vui(&mut reader),
        VideoFormat::Hevc => hevc_advance_to_vui(&mut reader),
        VideoFormat::Av1 => unreachable!(),
    };
    if advanced.is_none() {
        return false;
    }
    reader.read_flag().unwrap_or(false)
}

/// Locate the bits after the VUI flag, with rbsp_trailing_bits stripped
fn suffix_after_vui_flag(reader: &BitReader) -> Option<Vec<bool>> {
    let mut bits = reader.bits_between(reader.position(), reader.total_bits())?;
    while bits.last() == Some(&false) {
        bits.pop();
    }
    if bits.pop() != Some(true) {
        return None;
    }
    Some(bits)
}

fn rewrite_sps(
    packet: &[u8],
    format: VideoFormat,
    colorspace: &Colorspace,
) -> Option<Replacement> {
    let wanted = match format {
        VideoFormat::H264 => H264_NAL_SPS,
        VideoFormat::Hevc => HEVC_NAL_SPS,
        VideoFormat::Av1 => return None,
    };
    let nal = find_nal(packet, format, wanted)?;
    let rbsp = unescape_rbsp(nal.payload());
    let mut reader = BitReader::new(&rbsp);

    match format {
        VideoFormat::H264 => h264_advance_to_vui(&mut reader)?,
        VideoFormat::Hevc => hevc_advance_to_vui(&mut reader)?,
        VideoFormat::Av1 => return None,
    }

    let prefix = reader.bits_between(0, reader.position())?;
    let vui_present = reader.read_flag()?;

    let mut writer = BitWriter::default();
    writer.write_bools(&prefix);
    writer.write_flag(true);
    match format {
        VideoFormat::H264 => {
            // Nothing but trailing bits follows the H.264 VUI, so an SPS
            // that already had one is simply regenerated
            write_h264_vui(&mut writer, colorspace);
        }
        VideoFormat::Hevc => {
            if vui_present {
                // Separating an existing VUI from the SPS extensions that
                // follow it would need a full VUI parse
                return None;
            }
            write_hevc_vui(&mut writer, colorspace);
            writer.write_bools(&suffix_after_vui_flag(&reader)?);
        }
        VideoFormat::Av1 => return None,
    }

    let mut new_nal = nal.bytes[..nal.start_code_len].to_vec();
    new_nal.extend_from_slice(nal.header());
    new_nal.extend_from_slice(&escape_rbsp(&writer.finish()));

    Some(Replacement {
        old: nal.bytes.to_vec(),
        new: new_nal,
    })
}

/// Build the H.264 SPS replacement for an IDR packet
pub fn make_sps_h264(packet: &[u8], colorspace: &Colorspace) -> Option<Replacement> {
    rewrite_sps(packet, VideoFormat::H264, colorspace)
}

/// Build the HEVC (VPS, SPS) replacements for an IDR packet. The VPS is
/// re-staged unmodified so downstream always substitutes both headers as a
/// unit.
pub fn make_sps_hevc(packet: &[u8], colorspace: &Colorspace) -> Option<(Replacement, Replacement)> {
    let sps = rewrite_sps(packet, VideoFormat::Hevc, colorspace)?;
    let vps = find_nal(packet, VideoFormat::Hevc, HEVC_NAL_VPS)?;
    Some((
        Replacement {
            old: vps.bytes.to_vec(),
            new: vps.bytes.to_vec(),
        },
        sps,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal baseline-profile H.264 SPS for 1920x1088, no VUI
    fn h264_sps_rbsp(vui: bool) -> Vec<u8> {
        let mut w = BitWriter::default();
        w.write_bits(66, 8); // profile_idc: baseline
        w.write_bits(0, 8); // constraint flags
        w.write_bits(40, 8); // level_idc
        w.write_ue(0); // seq_parameter_set_id
        w.write_ue(0); // log2_max_frame_num_minus4
        w.write_ue(2); // pic_order_cnt_type
        w.write_ue(3); // max_num_ref_frames
        w.write_flag(false); // gaps_in_frame_num_value_allowed_flag
        w.write_ue(119); // pic_width_in_mbs_minus1
        w.write_ue(67); // pic_height_in_map_units_minus1
        w.write_flag(true); // frame_mbs_only_flag
        w.write_flag(true); // direct_8x8_inference_flag
        w.write_flag(false); // frame_cropping_flag
        w.write_flag(vui); // vui_parameters_present_flag
        if vui {
            write_h264_vui(&mut w, &Colorspace::default());
        }
        w.finish()
    }

    fn h264_sps_packet(vui: bool) -> Vec<u8> {
        let mut packet = vec![0, 0, 0, 1, 0x67];
        packet.extend_from_slice(&escape_rbsp(&h264_sps_rbsp(vui)));
        // Trailing IDR slice NAL so the SPS is not the last unit
        packet.extend_from_slice(&[0, 0, 1, 0x65, 0xaa, 0xbb]);
        packet
    }

    #[test]
    fn test_exp_golomb_round_trip() {
        let mut w = BitWriter::default();
        for value in [0u32, 1, 2, 3, 7, 119, 255, 4096] {
            w.write_ue(value);
        }
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        for expected in [0u32, 1, 2, 3, 7, 119, 255, 4096] {
            assert_eq!(r.read_ue(), Some(expected));
        }
    }

    #[test]
    fn test_rbsp_escape_round_trip() {
        let raw = vec![0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x42, 0x00, 0x00, 0x02];
        let escaped = escape_rbsp(&raw);
        assert_ne!(escaped, raw);
        assert_eq!(unescape_rbsp(&escaped), raw);
    }

    #[test]
    fn test_validate_sps_detects_vui() {
        assert!(!validate_sps(&h264_sps_packet(false), VideoFormat::H264));
        assert!(validate_sps(&h264_sps_packet(true), VideoFormat::H264));
    }

    #[test]
    fn test_validate_sps_rejects_garbage() {
        assert!(!validate_sps(&[0, 0, 1, 0x65, 1, 2, 3], VideoFormat::H264));
        assert!(!validate_sps(&[], VideoFormat::H264));
        assert!(!validate_sps(&h264_sps_packet(true), VideoFormat::Av1));
    }

    #[test]
    fn test_make_sps_h264_adds_vui() {
        let packet = h264_sps_packet(false);
        let colorspace = Colorspace {
            kind: ColorspaceKind::Rec709,
            bit_depth: 8,
            full_range: true,
        };
        let replacement = make_sps_h264(&packet, &colorspace).unwrap();

        // The old bytes are the SPS NAL exactly as it appears in the packet
        assert!(packet.windows(replacement.old.len()).any(|w| w == replacement.old));
        assert_ne!(replacement.old, replacement.new);

        // The rewritten SPS now carries VUI with our color description
        assert!(validate_sps(&replacement.new, VideoFormat::H264));

        let nal = find_nal(&replacement.new, VideoFormat::H264, H264_NAL_SPS).unwrap();
        let rbsp = unescape_rbsp(nal.payload());
        let mut reader = BitReader::new(&rbsp);
        h264_advance_to_vui(&mut reader).unwrap();
        assert_eq!(reader.read_flag(), Some(true)); // vui present
        assert_eq!(reader.read_flag(), Some(false)); // aspect ratio
        assert_eq!(reader.read_flag(), Some(false)); // overscan
        assert_eq!(reader.read_flag(), Some(true)); // video_signal_type
        assert_eq!(reader.read_bits(3), Some(5)); // video_format
        assert_eq!(reader.read_flag(), Some(true)); // full range
        assert_eq!(reader.read_flag(), Some(true)); // colour_description
        assert_eq!(reader.read_bits(8), Some(1)); // primaries: BT.709
    }

    #[test]
    fn test_make_sps_h264_regenerates_existing_vui() {
        let packet = h264_sps_packet(true);
        let replacement = make_sps_h264(&packet, &Colorspace::default()).unwrap();
        assert!(validate_sps(&replacement.new, VideoFormat::H264));
    }

    #[test]
    fn test_sps_prefix_preserved() {
        let packet = h264_sps_packet(false);
        let replacement = make_sps_h264(&packet, &Colorspace::default()).unwrap();

        let old_nal = find_nal(&packet, VideoFormat::H264, H264_NAL_SPS).unwrap();
        let old_rbsp = unescape_rbsp(old_nal.payload());
        let new_nal = find_nal(&replacement.new, VideoFormat::H264, H264_NAL_SPS).unwrap();
        let new_rbsp = unescape_rbsp(new_nal.payload());

        // Everything up to the VUI flag is bit-identical
        let mut old_reader = BitReader::new(&old_rbsp);
        h264_advance_to_vui(&mut old_reader).unwrap();
        let prefix_len = old_reader.position();
        let mut new_reader = BitReader::new(&new_rbsp);
        h264_advance_to_vui(&mut new_reader).unwrap();
        assert_eq!(new_reader.position(), prefix_len);
        assert_eq!(
            old_reader.bits_between(0, prefix_len),
            new_reader.bits_between(0, prefix_len)
        );
    }

    /// Minimal HEVC SPS (single layer, no scaling lists, no ref pic sets)
    fn hevc_sps_rbsp(vui: bool) -> Vec<u8> {
        let mut w = BitWriter::default();
        w.write_bits(0, 4); // sps_video_parameter_set_id
        w.write_bits(0, 3); // sps_max_sub_layers_minus1
        w.write_flag(true); // sps_temporal_id_nesting_flag
        for _ in 0..88 {
            w.write_bit(false); // profile tier
        }
        w.write_bits(120, 8); // general_level_idc
        w.write_ue(0); // sps_seq_parameter_set_id
        w.write_ue(1); // chroma_format_idc: 4:2:0
        w.write_ue(1920); // pic_width_in_luma_samples
        w.write_ue(1080); // pic_height_in_luma_samples
        w.write_flag(false); // conformance_window_flag
        w.write_ue(0); // bit_depth_luma_minus8
        w.write_ue(0); // bit_depth_chroma_minus8
        w.write_ue(4); // log2_max_pic_order_cnt_lsb_minus4
        w.write_flag(true); // sps_sub_layer_ordering_info_present_flag
        w.write_ue(1); // sps_max_dec_pic_buffering_minus1
        w.write_ue(0); // sps_max_num_reorder_pics
        w.write_ue(0); // sps_max_latency_increase_plus1
        w.write_ue(0); // log2_min_luma_coding_block_size_minus3
        w.write_ue(3); // log2_diff_max_min_luma_coding_block_size
        w.write_ue(0); // log2_min_luma_transform_block_size_minus2
        w.write_ue(3); // log2_diff_max_min_luma_transform_block_size
        w.write_ue(0); // max_transform_hierarchy_depth_inter
        w.write_ue(0); // max_transform_hierarchy_depth_intra
        w.write_flag(false); // scaling_list_enabled_flag
        w.write_flag(false); // amp_enabled_flag
        w.write_flag(true); // sample_adaptive_offset_enabled_flag
        w.write_flag(false); // pcm_enabled_flag
        w.write_ue(0); // num_short_term_ref_pic_sets
        w.write_flag(false); // long_term_ref_pics_present_flag
        w.write_flag(true); // sps_temporal_mvp_enabled_flag
        w.write_flag(true); // strong_intra_smoothing_enabled_flag
        w.write_flag(vui); // vui_parameters_present_flag
        if vui {
            write_hevc_vui(&mut w, &Colorspace::default());
        }
        w.write_flag(false); // sps_extension_present_flag
        w.finish()
    }

    fn hevc_packet(vui: bool) -> Vec<u8> {
        // VPS + SPS + slice
        let mut packet = vec![0, 0, 0, 1, 0x40, 0x01, 0x0c, 0x11];
        packet.extend_from_slice(&[0, 0, 0, 1, 0x42, 0x01]);
        packet.extend_from_slice(&escape_rbsp(&hevc_sps_rbsp(vui)));
        packet.extend_from_slice(&[0, 0, 1, 0x26, 0x01, 0xaf]);
        packet
    }

    #[test]
    fn test_validate_sps_hevc() {
        assert!(!validate_sps(&hevc_packet(false), VideoFormat::Hevc));
        assert!(validate_sps(&hevc_packet(true), VideoFormat::Hevc));
    }

    #[test]
    fn test_make_sps_hevc_stages_vps_and_sps() {
        let packet = hevc_packet(false);
        let colorspace = Colorspace {
            kind: ColorspaceKind::Bt2020Pq,
            bit_depth: 10,
            full_range: false,
        };
        let (vps, sps) = make_sps_hevc(&packet, &colorspace).unwrap();

        // VPS is re-staged byte for byte
        assert_eq!(vps.old, vps.new);
        assert_eq!(&vps.old[..5], &[0, 0, 0, 1, 0x40]);

        // SPS gains VUI and keeps the extension flag that follows it
        assert!(validate_sps(&sps.new, VideoFormat::Hevc));
        let nal = find_nal(&sps.new, VideoFormat::Hevc, HEVC_NAL_SPS).unwrap();
        let rbsp = unescape_rbsp(nal.payload());
        let mut reader = BitReader::new(&rbsp);
        hevc_advance_to_vui(&mut reader).unwrap();
        assert_eq!(reader.read_flag(), Some(true)); // vui present
        reader.skip_bits(2).unwrap(); // aspect + overscan
        assert_eq!(reader.read_flag(), Some(true)); // video_signal_type
        reader.skip_bits(3).unwrap(); // video_format
        assert_eq!(reader.read_flag(), Some(false)); // full range
        assert_eq!(reader.read_flag(), Some(true)); // colour_description
        assert_eq!(reader.read_bits(8), Some(9)); // primaries: BT.2020
        assert_eq!(reader.read_bits(8), Some(16)); // transfer: SMPTE 2084
    }

    #[test]
    fn test_make_sps_hevc_existing_vui_is_left_alone() {
        assert!(make_sps_hevc(&hevc_packet(true), &Colorspace::default()).is_none());
    }
}
