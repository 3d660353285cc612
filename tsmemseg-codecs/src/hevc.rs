//! H.265/HEVC parameter-set parsing.
//!
//! The SPS parse walks the full syntax up to and including the VUI
//! (aspect ratio, timing, HRD, bitstream restriction) because
//! `min_spatial_segmentation_idc` sits at the very end. The VPS and PPS
//! parses stop as soon as their contribution to `hvcC` is known.

use tsmemseg_core::bitstream::{ebsp_to_rbsp, BitReader};
use tsmemseg_core::Result;

/// Sample aspect ratio tables indexed by aspect_ratio_idc (0..=16).
const SAR_W_TABLE: [u32; 17] = [1, 1, 12, 10, 16, 40, 24, 20, 32, 80, 18, 15, 64, 160, 4, 3, 2];
const SAR_H_TABLE: [u32; 17] = [1, 1, 11, 11, 11, 33, 11, 11, 11, 33, 11, 11, 33, 99, 3, 2, 1];

/// Parsed HEVC sequence parameter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HevcSps {
    /// Coded width after the conformance window.
    pub codec_width: u32,
    /// Coded height after the conformance window.
    pub codec_height: u32,
    /// Sample aspect ratio width.
    pub sar_width: u32,
    /// Sample aspect ratio height (>= 1).
    pub sar_height: u32,
    /// chroma_format_idc.
    pub chroma_format_idc: u8,
    /// bit_depth_luma_minus8.
    pub bit_depth_luma_minus8: u8,
    /// bit_depth_chroma_minus8.
    pub bit_depth_chroma_minus8: u8,
    /// general_profile_space (2 bits).
    pub general_profile_space: u8,
    /// general_tier_flag.
    pub general_tier_flag: bool,
    /// general_profile_idc (5 bits).
    pub general_profile_idc: u8,
    /// general_profile_compatibility_flags, 4 bytes.
    pub general_profile_compatibility_flags: [u8; 4],
    /// general_constraint_indicator_flags, 6 bytes.
    pub general_constraint_indicator_flags: [u8; 6],
    /// general_level_idc.
    pub general_level_idc: u8,
    /// min_spatial_segmentation_idc from the VUI bitstream restriction.
    pub min_spatial_segmentation_idc: u16,
    /// sps_temporal_id_nesting_flag.
    pub temporal_id_nesting_flag: bool,
}

impl HevcSps {
    /// Parse an SPS from an EBSP NAL unit (2-byte header included).
    pub fn parse(ebsp: &[u8]) -> Result<Self> {
        let rbsp = ebsp_to_rbsp(ebsp);
        let mut r = BitReader::new(&rbsp);

        r.skip(16)?; // NAL header
        r.skip(4)?; // sps_video_parameter_set_id
        let max_sub_layers_minus1 = r.read_bits(3)? as usize;
        let temporal_id_nesting_flag = r.read_bit()?;

        // profile_tier_level
        let general_profile_space = r.read_bits(2)? as u8;
        let general_tier_flag = r.read_bit()?;
        let general_profile_idc = r.read_bits(5)? as u8;
        let mut general_profile_compatibility_flags = [0u8; 4];
        for flag in &mut general_profile_compatibility_flags {
            *flag = r.read_bits(8)? as u8;
        }
        let mut general_constraint_indicator_flags = [0u8; 6];
        for flag in &mut general_constraint_indicator_flags {
            *flag = r.read_bits(8)? as u8;
        }
        let general_level_idc = r.read_bits(8)? as u8;

        let mut sub_layer_profile_present = [false; 8];
        let mut sub_layer_level_present = [false; 8];
        for i in 0..max_sub_layers_minus1 {
            sub_layer_profile_present[i] = r.read_bit()?;
            sub_layer_level_present[i] = r.read_bit()?;
        }
        if max_sub_layers_minus1 > 0 {
            for _ in max_sub_layers_minus1..8 {
                r.skip(2)?; // reserved_zero_2bits
            }
        }
        for i in 0..max_sub_layers_minus1 {
            if sub_layer_profile_present[i] {
                r.skip(88)?;
            }
            if sub_layer_level_present[i] {
                r.skip(8)?;
            }
        }

        r.read_ue()?; // sps_seq_parameter_set_id
        let chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            r.skip(1)?; // separate_colour_plane_flag
        }
        let pic_width_in_luma_samples = r.read_ue()?;
        let pic_height_in_luma_samples = r.read_ue()?;

        let mut left_offset = 0u32;
        let mut right_offset = 0u32;
        let mut top_offset = 0u32;
        let mut bottom_offset = 0u32;
        if r.read_bit()? {
            // conformance_window_flag
            left_offset = r.read_ue()?;
            right_offset = r.read_ue()?;
            top_offset = r.read_ue()?;
            bottom_offset = r.read_ue()?;
        }

        let bit_depth_luma_minus8 = r.read_ue()?;
        let bit_depth_chroma_minus8 = r.read_ue()?;
        let log2_max_pic_order_cnt_lsb_minus4 = r.read_ue()? as usize;
        let sub_layer_ordering_info_present = r.read_bit()?;
        let ordering_count = if sub_layer_ordering_info_present {
            max_sub_layers_minus1
        } else {
            0
        };
        for _ in 0..=ordering_count {
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

        if r.read_bit()? {
            // scaling_list_enabled_flag
            if r.read_bit()? {
                skip_scaling_list_data(&mut r)?;
            }
        }

        r.skip(2)?; // amp_enabled_flag, sample_adaptive_offset_enabled_flag
        if r.read_bit()? {
            // pcm_enabled_flag
            r.skip(8)?; // pcm sample bit depths
            r.read_ue()?; // log2_min_pcm_luma_coding_block_size_minus3
            r.read_ue()?; // log2_diff_max_min_pcm_luma_coding_block_size
            r.skip(1)?; // pcm_loop_filter_disabled_flag
        }

        let num_short_term_ref_pic_sets = r.read_ue()?;
        let mut num_delta_pocs = 0u32;
        for i in 0..num_short_term_ref_pic_sets {
            let inter_ref_pic_set_prediction = if i != 0 { r.read_bit()? } else { false };
            if inter_ref_pic_set_prediction {
                r.read_bit()?; // delta_rps_sign
                r.read_ue()?; // abs_delta_rps_minus1
                let mut next_num_delta_pocs = 0u32;
                for _ in 0..=num_delta_pocs {
                    let used_by_curr_pic = r.read_bit()?;
                    let use_delta = if !used_by_curr_pic { r.read_bit()? } else { false };
                    if used_by_curr_pic || use_delta {
                        next_num_delta_pocs += 1;
                    }
                }
                num_delta_pocs = next_num_delta_pocs;
            } else {
                let num_negative_pics = r.read_ue()?;
                let num_positive_pics = r.read_ue()?;
                num_delta_pocs = num_negative_pics.saturating_add(num_positive_pics);
                for _ in 0..num_delta_pocs {
                    r.read_ue()?; // delta_poc_s*_minus1
                    r.read_bit()?; // used_by_curr_pic_s*_flag
                }
            }
        }

        if r.read_bit()? {
            // long_term_ref_pics_present_flag
            let num_long_term = r.read_ue()?;
            for _ in 0..num_long_term {
                r.skip(log2_max_pic_order_cnt_lsb_minus4 + 4)?; // lt_ref_pic_poc_lsb_sps
                r.skip(1)?; // used_by_curr_pic_lt_sps_flag
            }
        }

        let mut min_spatial_segmentation_idc = 0u32;
        let mut sar_width = 1u32;
        let mut sar_height = 1u32;

        r.skip(2)?; // sps_temporal_mvp_enabled_flag, strong_intra_smoothing_enabled_flag
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
            if r.read_bit()? {
                r.skip(1)?; // overscan_appropriate_flag
            }
            if r.read_bit()? {
                // video_signal_type_present_flag
                r.skip(4)?; // video_format, video_full_range_flag
                if r.read_bit()? {
                    r.skip(24)?; // colour primaries/transfer/matrix
                }
            }
            if r.read_bit()? {
                // chroma_loc_info_present_flag
                r.read_ue()?;
                r.read_ue()?;
            }
            r.skip(3)?; // neutral_chroma, field_seq, frame_field_info
            if r.read_bit()? {
                // default_display_window_flag
                r.read_ue()?;
                r.read_ue()?;
                r.read_ue()?;
                r.read_ue()?;
            }
            if r.read_bit()? {
                // vui_timing_info_present_flag
                r.skip(64)?; // num_units_in_tick, time_scale
                if r.read_bit()? {
                    r.read_ue()?; // num_ticks_poc_diff_one_minus1
                }
                if r.read_bit()? {
                    skip_hrd_parameters(&mut r, max_sub_layers_minus1)?;
                }
            }
            if r.read_bit()? {
                // bitstream_restriction_flag
                r.skip(3)?;
                min_spatial_segmentation_idc = r.read_ue()?;
                r.read_ue()?; // max_bytes_per_pic_denom
                r.read_ue()?; // max_bits_per_min_cu_denom
                r.read_ue()?; // log2_max_mv_length_horizontal
                r.read_ue()?; // log2_max_mv_length_vertical
            }
        }

        let sub_width_c = if chroma_format_idc == 1 || chroma_format_idc == 2 { 2 } else { 1 };
        let sub_height_c = if chroma_format_idc == 1 { 2 } else { 1 };
        let codec_width =
            pic_width_in_luma_samples.saturating_sub((left_offset + right_offset) * sub_width_c);
        let codec_height =
            pic_height_in_luma_samples.saturating_sub((top_offset + bottom_offset) * sub_height_c);

        Ok(Self {
            codec_width,
            codec_height,
            sar_width,
            sar_height,
            chroma_format_idc: chroma_format_idc as u8,
            bit_depth_luma_minus8: bit_depth_luma_minus8 as u8,
            bit_depth_chroma_minus8: bit_depth_chroma_minus8 as u8,
            general_profile_space,
            general_tier_flag,
            general_profile_idc,
            general_profile_compatibility_flags,
            general_constraint_indicator_flags,
            general_level_idc,
            min_spatial_segmentation_idc: min_spatial_segmentation_idc.min(0x0FFF) as u16,
            temporal_id_nesting_flag,
        })
    }
}

/// Parsed HEVC video parameter set (the two fields `hvcC` needs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HevcVps {
    /// vps_max_sub_layers_minus1 + 1.
    pub num_temporal_layers: u8,
    /// vps_temporal_id_nesting_flag.
    pub temporal_id_nesting_flag: bool,
}

impl HevcVps {
    /// Parse a VPS from an EBSP NAL unit (2-byte header included).
    pub fn parse(ebsp: &[u8]) -> Result<Self> {
        let rbsp = ebsp_to_rbsp(ebsp);
        let mut r = BitReader::new(&rbsp);

        r.skip(16)?; // NAL header
        r.skip(12)?; // vps id, base layer flags, vps_max_layers_minus1
        let num_temporal_layers = r.read_bits(3)? as u8 + 1;
        let temporal_id_nesting_flag = r.read_bit()?;

        Ok(Self {
            num_temporal_layers,
            temporal_id_nesting_flag,
        })
    }
}

/// Parsed HEVC picture parameter set (parallelism only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HevcPps {
    /// `hvcC` parallelismType derived from tiles/entropy-sync:
    /// (0,0)→1 slice, (1,0)→2 tile, (0,1)→3 wavefront, (1,1)→0 mixed.
    pub parallelism_type: u8,
}

impl HevcPps {
    /// Parse a PPS from an EBSP NAL unit (2-byte header included).
    pub fn parse(ebsp: &[u8]) -> Result<Self> {
        let rbsp = ebsp_to_rbsp(ebsp);
        let mut r = BitReader::new(&rbsp);

        r.skip(16)?; // NAL header
        r.read_ue()?; // pps_pic_parameter_set_id
        r.read_ue()?; // pps_seq_parameter_set_id
        r.skip(7)?; // dependent_slice/output_flag/extra_bits/sign_hiding/cabac_init
        r.read_ue()?; // num_ref_idx_l0_default_active_minus1
        r.read_ue()?; // num_ref_idx_l1_default_active_minus1
        r.read_se()?; // init_qp_minus26
        r.skip(2)?; // constrained_intra_pred, transform_skip_enabled
        if r.read_bit()? {
            // cu_qp_delta_enabled_flag
            r.read_ue()?; // diff_cu_qp_delta_depth
        }
        r.read_se()?; // pps_cb_qp_offset
        r.read_se()?; // pps_cr_qp_offset
        r.skip(4)?; // chroma_offsets_present, weighted_pred, weighted_bipred, transquant_bypass
        let tiles_enabled = r.read_bit()?;
        let entropy_coding_sync_enabled = r.read_bit()?;

        let parallelism_type = match (tiles_enabled, entropy_coding_sync_enabled) {
            (false, false) => 1,
            (true, false) => 2,
            (false, true) => 3,
            (true, true) => 0,
        };

        Ok(Self { parallelism_type })
    }
}

/// Skip sps_scaling_list_data.
fn skip_scaling_list_data(r: &mut BitReader<'_>) -> Result<()> {
    for size_id in 0..4 {
        let matrix_count = if size_id == 3 { 2 } else { 6 };
        for _ in 0..matrix_count {
            if r.read_bit()? {
                // scaling_list_pred_mode_flag == 1: explicit coefficients
                let coef_num = 64.min(1 << (4 + (size_id << 1)));
                if size_id > 1 {
                    r.read_se()?; // scaling_list_dc_coef_minus8
                }
                for _ in 0..coef_num {
                    r.read_se()?;
                }
            } else {
                r.read_ue()?; // scaling_list_pred_matrix_id_delta
            }
        }
    }
    Ok(())
}

/// Skip hrd_parameters (with commonInfPresentFlag = 1).
fn skip_hrd_parameters(r: &mut BitReader<'_>, max_sub_layers_minus1: usize) -> Result<()> {
    let mut sub_pic_hrd_params_present = false;
    let nal_hrd_parameters_present = r.read_bit()?;
    let vcl_hrd_parameters_present = r.read_bit()?;
    if nal_hrd_parameters_present || vcl_hrd_parameters_present {
        sub_pic_hrd_params_present = r.read_bit()?;
        if sub_pic_hrd_params_present {
            r.skip(19)?; // tick_divisor .. dpb_output_delay_du_length
        }
        r.skip(8)?; // bit_rate_scale, cpb_size_scale
        if sub_pic_hrd_params_present {
            r.skip(4)?; // cpb_size_du_scale
        }
        r.skip(15)?; // initial/au_cpb/dpb output delay lengths
    }
    for _ in 0..=max_sub_layers_minus1 {
        let fixed_pic_rate_general = r.read_bit()?;
        let fixed_pic_rate_within_cvs = if !fixed_pic_rate_general {
            r.read_bit()?
        } else {
            false
        };
        let mut low_delay_hrd = false;
        if fixed_pic_rate_within_cvs {
            r.read_se()?; // elemental_duration_in_tc_minus1
        } else {
            low_delay_hrd = r.read_bit()?;
        }
        let cpb_cnt = if !low_delay_hrd { r.read_ue()? + 1 } else { 1 };
        let layer_count =
            nal_hrd_parameters_present as u32 + vcl_hrd_parameters_present as u32;
        for _ in 0..layer_count {
            for _ in 0..cpb_cnt {
                r.read_ue()?; // bit_rate_value_minus1
                r.read_ue()?; // cpb_size_value_minus1
                if sub_pic_hrd_params_present {
                    r.read_ue()?; // cpb_size_du_value_minus1
                    r.read_ue()?; // bit_rate_du_value_minus1
                }
                r.skip(1)?; // cbr_flag
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bit-level builder shared by the HEVC tests.
    struct Builder {
        bits: Vec<bool>,
    }

    impl Builder {
        fn new() -> Self {
            Self { bits: Vec::new() }
        }

        fn bit(&mut self, b: u32) -> &mut Self {
            self.bits.push(b != 0);
            self
        }

        fn bits(&mut self, value: u32, n: u8) -> &mut Self {
            for i in (0..n).rev() {
                self.bits.push((value >> i) & 1 != 0);
            }
            self
        }

        fn ue(&mut self, value: u32) -> &mut Self {
            let v = value + 1;
            let len = 32 - v.leading_zeros() as u8;
            for _ in 0..len - 1 {
                self.bits.push(false);
            }
            self.bits(v, len)
        }

        fn se(&mut self, value: i32) -> &mut Self {
            let ue = if value <= 0 { (-2 * value) as u32 } else { (2 * value - 1) as u32 };
            self.ue(ue)
        }

        fn finish(&self) -> Vec<u8> {
            let mut data = vec![0u8; self.bits.len().div_ceil(8)];
            for (i, &b) in self.bits.iter().enumerate() {
                if b {
                    data[i / 8] |= 1 << (7 - (i % 8));
                }
            }
            data
        }
    }

    /// A minimal 1920x1080 main-profile SPS; `max_sub_layers_minus1 = 0` so
    /// the sub-layer loops must consume no bits.
    fn build_sps(chroma: u32, bit_depth_luma_minus8: u32, crop_bottom: u32) -> Vec<u8> {
        let mut b = Builder::new();
        b.bits(0x42, 8).bits(0x01, 8); // NAL header (type 33)
        b.bits(0, 4); // sps_video_parameter_set_id
        b.bits(0, 3); // sps_max_sub_layers_minus1
        b.bit(1); // sps_temporal_id_nesting_flag
        // profile_tier_level
        b.bits(0, 2); // profile_space
        b.bit(0); // tier
        b.bits(1, 5); // profile_idc = 1 (Main)
        b.bits(0x60, 8).bits(0, 8).bits(0, 8).bits(0, 8); // compatibility
        b.bits(0x90, 8).bits(0, 8).bits(0, 8).bits(0, 8).bits(0, 8).bits(0, 8); // constraints
        b.bits(123, 8); // level_idc (4.1)
        b.ue(0); // sps_seq_parameter_set_id
        b.ue(chroma); // chroma_format_idc
        if chroma == 3 {
            b.bit(0);
        }
        b.ue(1920); // pic_width_in_luma_samples
        b.ue(1088); // pic_height_in_luma_samples
        if crop_bottom > 0 {
            b.bit(1);
            b.ue(0);
            b.ue(0);
            b.ue(0);
            b.ue(crop_bottom);
        } else {
            b.bit(0);
        }
        b.ue(bit_depth_luma_minus8);
        b.ue(0); // bit_depth_chroma_minus8
        b.ue(4); // log2_max_pic_order_cnt_lsb_minus4
        b.bit(0); // sps_sub_layer_ordering_info_present_flag
        b.ue(3).ue(0).ue(0); // ordering info for the single layer
        b.ue(0); // log2_min_luma_coding_block_size_minus3
        b.ue(3); // log2_diff_max_min_luma_coding_block_size
        b.ue(0); // log2_min_luma_transform_block_size_minus2
        b.ue(3); // log2_diff_max_min_luma_transform_block_size
        b.ue(0); // max_transform_hierarchy_depth_inter
        b.ue(0); // max_transform_hierarchy_depth_intra
        b.bit(0); // scaling_list_enabled_flag
        b.bit(0).bit(1); // amp, sao
        b.bit(0); // pcm_enabled_flag
        // One short-term ref pic set with one negative picture, plus a
        // second set using inter prediction.
        b.ue(2); // num_short_term_ref_pic_sets
        b.ue(1).ue(0); // set 0: 1 negative, 0 positive
        b.ue(0).bit(1); // delta_poc_s0_minus1, used_by_curr_pic
        b.bit(1); // set 1: inter_ref_pic_set_prediction_flag
        b.bit(0); // delta_rps_sign
        b.ue(0); // abs_delta_rps_minus1
        b.bit(1).bit(1); // used_by_curr_pic for numDeltaPocs+1 = 2 entries
        b.bit(0); // long_term_ref_pics_present_flag
        b.bit(1).bit(0); // temporal_mvp, strong_intra_smoothing
        // VUI with bitstream restriction carrying min_spatial_segmentation.
        b.bit(1); // vui_parameters_present_flag
        b.bit(0); // aspect_ratio_info_present_flag
        b.bit(0); // overscan
        b.bit(0); // video_signal_type
        b.bit(0); // chroma_loc_info
        b.bits(0, 3); // neutral_chroma, field_seq, frame_field_info
        b.bit(0); // default_display_window
        b.bit(0); // vui_timing_info_present_flag
        b.bit(1); // bitstream_restriction_flag
        b.bits(0, 3);
        b.ue(24); // min_spatial_segmentation_idc
        b.ue(0).ue(0).ue(15).ue(15);
        b.bit(1); // rbsp stop
        b.finish()
    }

    #[test]
    fn test_sps_dimensions_and_crop() {
        let sps = HevcSps::parse(&build_sps(1, 0, 4)).unwrap();
        // chroma 4:2:0 -> subHC = 2, so crop_bottom 4 removes 8 rows.
        assert_eq!(sps.codec_width, 1920);
        assert_eq!(sps.codec_height, 1080);
        assert_eq!(sps.chroma_format_idc, 1);
        assert!(sps.temporal_id_nesting_flag);
    }

    #[test]
    fn test_sps_profile_tier_level() {
        let sps = HevcSps::parse(&build_sps(1, 0, 0)).unwrap();
        assert_eq!(sps.general_profile_space, 0);
        assert!(!sps.general_tier_flag);
        assert_eq!(sps.general_profile_idc, 1);
        assert_eq!(sps.general_profile_compatibility_flags[0], 0x60);
        assert_eq!(sps.general_constraint_indicator_flags[0], 0x90);
        assert_eq!(sps.general_level_idc, 123);
        assert_eq!(sps.min_spatial_segmentation_idc, 24);
    }

    #[test]
    fn test_sps_bit_depth() {
        let sps = HevcSps::parse(&build_sps(1, 2, 0)).unwrap();
        assert_eq!(sps.bit_depth_luma_minus8, 2);
        assert_eq!(sps.bit_depth_chroma_minus8, 0);
    }

    #[test]
    fn test_sps_idempotent() {
        let data = build_sps(1, 0, 4);
        assert_eq!(HevcSps::parse(&data).unwrap(), HevcSps::parse(&data).unwrap());
    }

    #[test]
    fn test_sps_truncated_fails() {
        let data = build_sps(1, 0, 0);
        assert!(HevcSps::parse(&data[..10]).is_err());
    }

    #[test]
    fn test_vps_parse() {
        let mut b = Builder::new();
        b.bits(0x40, 8).bits(0x01, 8); // NAL header (type 32)
        b.bits(0, 4); // vps_video_parameter_set_id
        b.bit(1).bit(1); // base layer internal/available
        b.bits(0, 6); // vps_max_layers_minus1
        b.bits(1, 3); // vps_max_sub_layers_minus1 -> 2 temporal layers
        b.bit(1); // vps_temporal_id_nesting_flag
        b.bits(0xFFFF, 16); // vps_reserved_0xffff_16bits
        let vps = HevcVps::parse(&b.finish()).unwrap();
        assert_eq!(vps.num_temporal_layers, 2);
        assert!(vps.temporal_id_nesting_flag);
    }

    fn build_pps(tiles: u32, entropy_sync: u32) -> Vec<u8> {
        let mut b = Builder::new();
        b.bits(0x44, 8).bits(0x01, 8); // NAL header (type 34)
        b.ue(0); // pps id
        b.ue(0); // sps id
        b.bit(0).bit(0); // dependent_slice, output_flag
        b.bits(0, 3); // num_extra_slice_header_bits
        b.bit(0).bit(0); // sign_data_hiding, cabac_init_present
        b.ue(0).ue(0); // num_ref_idx defaults
        b.se(0); // init_qp_minus26
        b.bit(0).bit(0); // constrained_intra_pred, transform_skip
        b.bit(1); // cu_qp_delta_enabled_flag
        b.ue(1); // diff_cu_qp_delta_depth
        b.se(0).se(0); // cb/cr offsets
        b.bits(0, 4); // four presence flags
        b.bit(tiles);
        b.bit(entropy_sync);
        b.bit(1); // trailing data
        b.finish()
    }

    #[test]
    fn test_pps_parallelism_type() {
        assert_eq!(HevcPps::parse(&build_pps(0, 0)).unwrap().parallelism_type, 1);
        assert_eq!(HevcPps::parse(&build_pps(1, 0)).unwrap().parallelism_type, 2);
        assert_eq!(HevcPps::parse(&build_pps(0, 1)).unwrap().parallelism_type, 3);
        assert_eq!(HevcPps::parse(&build_pps(1, 1)).unwrap().parallelism_type, 0);
    }
}
