//! H.264/AVC parameter-set parsing.
//!
//! Only the fields the fMP4 builder needs are kept: coded dimensions after
//! cropping, sample aspect ratio, chroma format and bit depths. The parse
//! follows the SPS syntax far enough to reach the VUI aspect ratio and no
//! further.

use tsmemseg_core::bitstream::{ebsp_to_rbsp, BitReader};
use tsmemseg_core::Result;

/// Profiles that carry chroma format and bit-depth fields in the SPS.
const HAS_CHROMA_INFO: [u8; 12] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134];

/// Sample aspect ratio tables indexed by aspect_ratio_idc (0..=16).
const SAR_W_TABLE: [u32; 17] = [1, 1, 12, 10, 16, 40, 24, 20, 32, 80, 18, 15, 64, 160, 4, 3, 2];
const SAR_H_TABLE: [u32; 17] = [1, 1, 11, 11, 11, 33, 11, 11, 11, 33, 11, 11, 33, 99, 3, 2, 1];

/// Parsed AVC sequence parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvcSps {
    /// Profile indication (SPS byte 1).
    pub profile_idc: u8,
    /// Coded width after cropping.
    pub codec_width: u32,
    /// Coded height after cropping.
    pub codec_height: u32,
    /// Sample aspect ratio width.
    pub sar_width: u32,
    /// Sample aspect ratio height (>= 1).
    pub sar_height: u32,
    /// chroma_format_idc (defaults to 1 for non-high profiles).
    pub chroma_format_idc: u8,
    /// bit_depth_luma_minus8.
    pub bit_depth_luma_minus8: u8,
    /// bit_depth_chroma_minus8.
    pub bit_depth_chroma_minus8: u8,
}

impl AvcSps {
    /// Parse an SPS from an EBSP NAL unit (header byte included).
    pub fn parse(ebsp: &[u8]) -> Result<Self> {
        let rbsp = ebsp_to_rbsp(ebsp);
        let mut r = BitReader::new(&rbsp);

        r.skip(8)?; // NAL header
        let profile_idc = r.read_bits(8)? as u8;
        r.skip(16)?; // constraint flags + level_idc
        r.read_ue()?; // seq_parameter_set_id

        let mut chroma_format_idc = 1u32;
        let mut bit_depth_luma_minus8 = 0u32;
        let mut bit_depth_chroma_minus8 = 0u32;
        if HAS_CHROMA_INFO.contains(&profile_idc) {
            chroma_format_idc = r.read_ue()?;
            if chroma_format_idc == 3 {
                r.skip(1)?; // separate_colour_plane_flag
            }
            bit_depth_luma_minus8 = r.read_ue()?;
            bit_depth_chroma_minus8 = r.read_ue()?;
            r.skip(1)?; // qpprime_y_zero_transform_bypass_flag
            if r.read_bit()? {
                // seq_scaling_matrix_present_flag
                let list_count = if chroma_format_idc != 3 { 8 } else { 12 };
                for i in 0..list_count {
                    if r.read_bit()? {
                        skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        r.read_ue()?; // log2_max_frame_num_minus4
        let pic_order_cnt_type = r.read_ue()?;
        if pic_order_cnt_type == 0 {
            r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
        } else if pic_order_cnt_type == 1 {
            r.skip(1)?; // delta_pic_order_always_zero_flag
            r.read_se()?; // offset_for_non_ref_pic
            r.read_se()?; // offset_for_top_to_bottom_field
            let num_ref_frames_in_poc_cycle = r.read_ue()?;
            for _ in 0..num_ref_frames_in_poc_cycle {
                r.read_se()?;
            }
        }

        r.read_ue()?; // max_num_ref_frames
        r.skip(1)?; // gaps_in_frame_num_value_allowed_flag
        let pic_width_in_mbs_minus1 = r.read_ue()?;
        let pic_height_in_map_units_minus1 = r.read_ue()?;
        let frame_mbs_only_flag = r.read_bit()?;
        if !frame_mbs_only_flag {
            r.skip(1)?; // mb_adaptive_frame_field_flag
        }
        r.skip(1)?; // direct_8x8_inference_flag

        let mut crop_left = 0u32;
        let mut crop_right = 0u32;
        let mut crop_top = 0u32;
        let mut crop_bottom = 0u32;
        if r.read_bit()? {
            crop_left = r.read_ue()?;
            crop_right = r.read_ue()?;
            crop_top = r.read_ue()?;
            crop_bottom = r.read_ue()?;
        }

        let mut sar_width = 1u32;
        let mut sar_height = 1u32;
        if r.read_bit()? {
            // vui_parameters_present_flag
            if r.read_bit()? {
                // aspect_ratio_info_present_flag
                let aspect_ratio_idc = r.read_bits(8)? as usize;
                if aspect_ratio_idc < 17 {
                    sar_width = SAR_W_TABLE[aspect_ratio_idc];
                    sar_height = SAR_H_TABLE[aspect_ratio_idc];
                } else if aspect_ratio_idc == 255 {
                    sar_width = r.read_bits(16)?;
                    sar_height = r.read_bits(16)?.max(1);
                }
            }
        }

        let frame_height_factor = 2 - frame_mbs_only_flag as u32;
        let crop_unit_x = if chroma_format_idc == 0 || chroma_format_idc == 3 { 1 } else { 2 };
        let crop_unit_y = if chroma_format_idc == 1 { 2 } else { 1 } * frame_height_factor;

        let codec_width = ((pic_width_in_mbs_minus1 + 1) * 16)
            .saturating_sub((crop_left + crop_right) * crop_unit_x);
        let codec_height = (frame_height_factor * ((pic_height_in_map_units_minus1 + 1) * 16))
            .saturating_sub((crop_top + crop_bottom) * crop_unit_y);

        Ok(Self {
            profile_idc,
            codec_width,
            codec_height,
            sar_width,
            sar_height,
            chroma_format_idc: chroma_format_idc as u8,
            bit_depth_luma_minus8: bit_depth_luma_minus8 as u8,
            bit_depth_chroma_minus8: bit_depth_chroma_minus8 as u8,
        })
    }
}

/// Skip one scaling list, tracking the zero terminator.
fn skip_scaling_list(r: &mut BitReader<'_>, size: u32) -> Result<()> {
    let mut last_scale = 8i32;
    let mut remaining = size;
    while remaining > 0 && last_scale != 0 {
        let delta_scale = r.read_se()?;
        last_scale = (last_scale + delta_scale) & 0xFF;
        remaining -= 1;
    }
    Ok(())
}

/// Probe a non-IDR AVC slice NAL for an I or SI picture.
///
/// Only valid when the first slice-header bytes are free of emulation
/// prevention, which holds unless first_mb_in_slice is enormous; otherwise
/// the probe conservatively reports false.
pub fn slice_is_intra(nal: &[u8]) -> bool {
    if nal.len() >= 5 && (nal[1] != 0 || nal[2] != 0 || nal[3] != 3) {
        let mut intro = [0u8; 16];
        intro[..4].copy_from_slice(&nal[1..5]);
        let mut r = BitReader::new(&intro);
        if r.read_ue().is_ok() {
            // first_mb_in_slice consumed
            if let Ok(slice_type) = r.read_ue() {
                return matches!(slice_type, 2 | 4 | 7 | 9);
            }
        }
    }
    false
}
