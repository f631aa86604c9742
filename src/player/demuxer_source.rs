use crate::core::{MediaMetaData, Packet, Result, StreamInfo};
use crate::player::codec::Codec;

/// Demuxer 数据源抽象接口
///
/// 不同的媒体源（FFmpeg 容器、测试用的内存源等）实现这个接口，
/// Demuxer 线程只通过它读包、seek、切换流的丢弃标志和打开解码器。
pub trait DemuxerSource: Send {
    /// 容器内所有流（下标即流索引）
    fn streams(&self) -> &[StreamInfo];

    /// 读取下一个数据包
    ///
    /// 返回：
    /// - Ok(Some(packet)): 成功读取一个包
    /// - Ok(None): 到达文件末尾
    /// - Err(e): 读取错误
    fn read_packet(&mut self) -> Result<Option<Packet>>;

    /// 向后 seek 到不晚于 `position_ms` 的关键帧
    fn seek(&mut self, position_ms: i64) -> Result<()>;

    /// 设置流的丢弃标志；被丢弃的流不再产生数据包
    fn set_discard(&mut self, stream_index: usize, discard: bool);

    /// 为指定流打开解码器
    fn open_codec(&self, stream_index: usize) -> Result<Box<dyn Codec>>;

    /// 是否支持 seek
    fn is_seekable(&self) -> bool {
        true
    }

    /// 总时长（毫秒），默认取各流时长的最大值
    fn duration(&self) -> i64 {
        self.streams().iter().map(|s| s.duration).max().unwrap_or(0)
    }

    /// 容器级元数据
    fn metadata(&self) -> MediaMetaData {
        MediaMetaData::default()
    }

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;
}
