use fileset::BlockFileWriter;
use row::{Block, Row};
use tracing::debug;

use crate::EngineError;

/// Groups a sorted row stream into blocks for a [`BlockFileWriter`].
///
/// A block is cut when it reaches `block_rows` or when the next row belongs
/// to a different container. The buffer is reserved with `try_reserve`, so
/// an allocation failure surfaces as [`EngineError::OutOfMemory`].
pub(crate) struct BlockBuffer {
    block: Block,
    block_rows: usize,
}

impl BlockBuffer {
    pub(crate) fn new(block_rows: usize) -> Self {
        Self {
            block: Block::new(),
            block_rows: block_rows.max(1),
        }
    }

    pub(crate) fn push(&mut self, row: Row, out: &mut BlockFileWriter) -> Result<(), EngineError> {
        if let Some(container) = self.block.container_id() {
            if self.block.len() >= self.block_rows || container != row.key.container_id {
                self.flush(out)?;
            }
        }
        if self.block.is_empty() {
            self.block
                .try_reserve(self.block_rows)
                .map_err(|_| EngineError::OutOfMemory {
                    rows: self.block_rows,
                })?;
        }
        self.block.push(row);
        Ok(())
    }

    /// Writes out whatever is buffered.
    pub(crate) fn flush(&mut self, out: &mut BlockFileWriter) -> Result<(), EngineError> {
        if self.block.is_empty() {
            return Ok(());
        }
        let info = out.append_block(&self.block)?;
        debug!(
            rows = info.row_count,
            offset = info.offset,
            container = ?self.block.container_id(),
            "block flushed"
        );
        self.block.clear();
        Ok(())
    }
}
