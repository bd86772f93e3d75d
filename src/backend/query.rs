// GPU frame profiling
//
// Each frame slot owns a timestamp query pool (start and end of the frame's
// primary buffer) and, where the GPU supports it, a pipeline statistics pool
// spanning the same commands. Results are read back only after the slot's
// fence has retired, so the read never stalls.

use ash::vk;

use super::error::{RenderResult, VkResultExt};
use super::VulkanDevice;

const TIMESTAMP_QUERIES: u32 = 2;

/// Counters gathered by the statistics pool, in result order.
const STATISTICS_FLAGS: vk::QueryPipelineStatisticFlags = vk::QueryPipelineStatisticFlags::from_raw(
    vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_VERTICES.as_raw()
        | vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_PRIMITIVES.as_raw()
        | vk::QueryPipelineStatisticFlags::VERTEX_SHADER_INVOCATIONS.as_raw()
        | vk::QueryPipelineStatisticFlags::CLIPPING_INVOCATIONS.as_raw()
        | vk::QueryPipelineStatisticFlags::CLIPPING_PRIMITIVES.as_raw()
        | vk::QueryPipelineStatisticFlags::FRAGMENT_SHADER_INVOCATIONS.as_raw()
        | vk::QueryPipelineStatisticFlags::COMPUTE_SHADER_INVOCATIONS.as_raw(),
);
const STATISTICS_COUNT: usize = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStatistics {
    pub input_assembly_vertices: u64,
    pub input_assembly_primitives: u64,
    pub vertex_shader_invocations: u64,
    pub clipping_invocations: u64,
    pub clipping_primitives: u64,
    pub fragment_shader_invocations: u64,
    pub compute_shader_invocations: u64,
}

impl PipelineStatistics {
    fn from_results(raw: &[u64; STATISTICS_COUNT]) -> Self {
        Self {
            input_assembly_vertices: raw[0],
            input_assembly_primitives: raw[1],
            vertex_shader_invocations: raw[2],
            clipping_invocations: raw[3],
            clipping_primitives: raw[4],
            fragment_shader_invocations: raw[5],
            compute_shader_invocations: raw[6],
        }
    }
}

/// What one retired frame cost on the GPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameTimings {
    pub gpu_time_ns: u64,
    pub statistics: Option<PipelineStatistics>,
}

/// Nanoseconds between two raw timestamps. Only the low `valid_bits` of a
/// timestamp are meaningful, so the counter may wrap between the two.
pub fn timestamp_delta_ns(begin: u64, end: u64, valid_bits: u32, period_ns: f32) -> u64 {
    let mask = if valid_bits >= 64 { u64::MAX } else { (1u64 << valid_bits) - 1 };
    let ticks = end.wrapping_sub(begin) & mask;
    (ticks as f64 * period_ns as f64) as u64
}

pub struct FrameQueries {
    timestamps: vk::QueryPool,
    statistics: Option<vk::QueryPool>,
    valid_bits: u32,
    period_ns: f32,
    /// Set once the end-of-frame queries are recorded; cleared by `read` and
    /// by the next `begin`.
    written: bool,
}

impl FrameQueries {
    /// `Ok(None)` when the graphics queue has no usable timestamps.
    pub fn new(device: &VulkanDevice, index: usize) -> RenderResult<Option<Self>> {
        let valid_bits = device.physical.graphics_timestamp_bits;
        let period_ns = device.physical.properties.limits.timestamp_period;
        if valid_bits == 0 || period_ns <= 0.0 {
            return Ok(None);
        }

        let raw = &device.device;
        let timestamp_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(TIMESTAMP_QUERIES);
        let timestamps = unsafe { raw.create_query_pool(&timestamp_info, None) }.vk_context("vkCreateQueryPool")?;
        device.set_object_name(timestamps, &format!("Frame {} timestamps", index));

        let statistics = if device.physical.features.pipeline_statistics_query == vk::TRUE {
            let statistics_info = vk::QueryPoolCreateInfo::builder()
                .query_type(vk::QueryType::PIPELINE_STATISTICS)
                .query_count(1)
                .pipeline_statistics(STATISTICS_FLAGS);
            match unsafe { raw.create_query_pool(&statistics_info, None) } {
                Ok(pool) => Some(pool),
                Err(e) => {
                    unsafe { raw.destroy_query_pool(timestamps, None) };
                    return Err(e).vk_context("vkCreateQueryPool");
                }
            }
        } else {
            None
        };

        Ok(Some(Self {
            timestamps,
            statistics,
            valid_bits,
            period_ns,
            written: false,
        }))
    }

    /// Reset the pools and open the frame's queries. Must be recorded outside
    /// any render pass.
    pub fn begin(&mut self, device: &ash::Device, command_buffer: vk::CommandBuffer) {
        self.written = false;
        unsafe {
            device.cmd_reset_query_pool(command_buffer, self.timestamps, 0, TIMESTAMP_QUERIES);
            device.cmd_write_timestamp(command_buffer, vk::PipelineStageFlags::TOP_OF_PIPE, self.timestamps, 0);
            if let Some(statistics) = self.statistics {
                device.cmd_reset_query_pool(command_buffer, statistics, 0, 1);
                device.cmd_begin_query(command_buffer, statistics, 0, vk::QueryControlFlags::empty());
            }
        }
    }

    pub fn end(&mut self, device: &ash::Device, command_buffer: vk::CommandBuffer) {
        unsafe {
            if let Some(statistics) = self.statistics {
                device.cmd_end_query(command_buffer, statistics, 0);
            }
            device.cmd_write_timestamp(command_buffer, vk::PipelineStageFlags::BOTTOM_OF_PIPE, self.timestamps, 1);
        }
        self.written = true;
    }

    /// Results of the last submitted frame. Call only after the slot's fence
    /// has been waited on.
    pub fn read(&mut self, device: &ash::Device) -> RenderResult<Option<FrameTimings>> {
        if !std::mem::take(&mut self.written) {
            return Ok(None);
        }

        let mut stamps = [0u64; TIMESTAMP_QUERIES as usize];
        let read = unsafe {
            device.get_query_pool_results(
                self.timestamps,
                0,
                TIMESTAMP_QUERIES,
                &mut stamps,
                vk::QueryResultFlags::TYPE_64,
            )
        };
        match read {
            Ok(()) => {}
            Err(vk::Result::NOT_READY) => return Ok(None),
            Err(e) => return Err(e).vk_context("vkGetQueryPoolResults"),
        }

        let statistics = match self.statistics {
            Some(pool) => {
                // One query whose result is every enabled counter
                let mut raw = [[0u64; STATISTICS_COUNT]; 1];
                let read = unsafe {
                    device.get_query_pool_results(pool, 0, 1, &mut raw, vk::QueryResultFlags::TYPE_64)
                };
                match read {
                    Ok(()) => Some(PipelineStatistics::from_results(&raw[0])),
                    Err(vk::Result::NOT_READY) => None,
                    Err(e) => return Err(e).vk_context("vkGetQueryPoolResults"),
                }
            }
            None => None,
        };

        Ok(Some(FrameTimings {
            gpu_time_ns: timestamp_delta_ns(stamps[0], stamps[1], self.valid_bits, self.period_ns),
            statistics,
        }))
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_query_pool(self.timestamps, None);
            if let Some(statistics) = self.statistics {
                device.destroy_query_pool(statistics, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_scales_ticks_by_the_timestamp_period() {
        assert_eq!(timestamp_delta_ns(1_000, 5_000, 64, 1.0), 4_000);
        assert_eq!(timestamp_delta_ns(1_000, 5_000, 64, 2.5), 10_000);
    }

    #[test]
    fn delta_survives_a_counter_wrap() {
        // 36-bit counter wrapping between the two writes
        let top = (1u64 << 36) - 10;
        assert_eq!(timestamp_delta_ns(top, 20, 36, 1.0), 30);
    }

    #[test]
    fn statistics_follow_result_order() {
        let stats = PipelineStatistics::from_results(&[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(stats.input_assembly_vertices, 1);
        assert_eq!(stats.clipping_primitives, 5);
        assert_eq!(stats.compute_shader_invocations, 7);
    }
}
