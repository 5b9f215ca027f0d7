//! Batched EPT page-access and sub-page write-bitmap control.
//!
//! Large requests are split into as many frames as needed, one command per
//! frame, sent in order. A failing chunk stops the batch: earlier chunks
//! stay applied and later ones are never sent.

use kvmi_proto::{
    Access, Batch, ControlSpp, GetPageAccess, GetPageWriteBitmap, PageAccessEntry, SetPageAccess,
    SetPageWriteBitmap, WriteBitmapEntry,
};

use crate::domain::Domain;
use crate::error::{Result, UsageError};

impl Domain {
    /// Sets EPT permissions for `entries` in `view`.
    pub async fn set_page_access(&self, view: u16, entries: &[PageAccessEntry]) -> Result<()> {
        self.batch::<SetPageAccess>(view, entries, |()| {}).await
    }

    /// Reads EPT permissions for `gpas` in `view`, in order.
    pub async fn get_page_access(&self, view: u16, gpas: &[u64]) -> Result<Vec<Access>> {
        let mut out = Vec::with_capacity(gpas.len());
        self.batch::<GetPageAccess>(view, gpas, |chunk| out.extend(chunk))
            .await?;
        Ok(out)
    }

    /// Sets sub-page write bitmaps for `entries` in `view`.
    pub async fn set_page_write_bitmap(
        &self,
        view: u16,
        entries: &[WriteBitmapEntry],
    ) -> Result<()> {
        self.batch::<SetPageWriteBitmap>(view, entries, |()| {})
            .await
    }

    /// Reads sub-page write bitmaps for `gpas` in `view`, in order.
    pub async fn get_page_write_bitmap(&self, view: u16, gpas: &[u64]) -> Result<Vec<u32>> {
        let mut out = Vec::with_capacity(gpas.len());
        self.batch::<GetPageWriteBitmap>(view, gpas, |chunk| out.extend(chunk))
            .await?;
        Ok(out)
    }

    /// Turns sub-page write protection on or off for the whole guest.
    pub async fn control_spp(&self, enable: bool) -> Result<()> {
        self.request(&ControlSpp { enable }).await
    }

    async fn batch<B: Batch>(
        &self,
        view: u16,
        items: &[B::Item],
        mut collect: impl FnMut(B::Reply),
    ) -> Result<()> {
        if B::CAPACITY == 0 {
            return Err(UsageError::EntryTooLarge {
                size: B::ITEM_SIZE,
            }
            .into());
        }
        let chunks = items.len().div_ceil(B::CAPACITY);
        for (i, chunk) in items.chunks(B::CAPACITY).enumerate() {
            let cmd = B::with_items(view, chunk.to_vec());
            match self.request(&cmd).await {
                Ok(reply) => collect(reply),
                Err(e) => {
                    tracing::debug!(id = ?B::ID, chunk = i, chunks, error = %e, "batch stopped");
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use kvmi_proto::{BatchBody, MessageId, Reader, RemoteErrno};

    use super::*;
    use crate::config::Config;
    use crate::error::Error;
    use crate::testing::{FakeHypervisor, connect};

    fn entries(n: u64) -> Vec<PageAccessEntry> {
        (0..n)
            .map(|i| PageAccessEntry {
                gpa: i << 12,
                access: Access::R,
            })
            .collect()
    }

    #[tokio::test]
    async fn single_entry_is_one_frame() {
        let (domain, mut hv) = connect(Config::default());
        let entry = PageAccessEntry {
            gpa: 0x1000,
            access: Access::R | Access::X,
        };
        let (frame, result) = hv
            .serve(domain.set_page_access(0, &[entry]), |_| {
                FakeHypervisor::ok_body(&[])
            })
            .await;
        result.unwrap();

        assert_eq!(frame.header.id, MessageId::SetPageAccess as u16);
        let batch = BatchBody::parse(&frame.body, PageAccessEntry::SIZE).unwrap();
        assert_eq!((batch.view, batch.count), (0, 1));
        let mut r = Reader::new(batch.elements);
        assert_eq!(r.u64().unwrap(), 0x1000);
        assert_eq!(r.u8().unwrap(), 0b101);
        assert!(hv.try_recv_within(std::time::Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn large_set_is_chunked() {
        let (domain, mut hv) = connect(Config::default());
        let all = entries(1021);
        let (frames, result) = hv
            .serve_n(domain.set_page_access(2, &all), 3, |_, _| {
                FakeHypervisor::ok_body(&[])
            })
            .await;
        result.unwrap();

        let counts: Vec<u16> = frames
            .iter()
            .map(|f| BatchBody::parse(&f.body, PageAccessEntry::SIZE).unwrap().count)
            .collect();
        assert_eq!(counts, [510, 510, 1]);
        assert!(frames.iter().all(|f| f.body[0] == 2));
        let last = BatchBody::parse(&frames[2].body, PageAccessEntry::SIZE).unwrap();
        assert_eq!(Reader::new(last.elements).u64().unwrap(), 1020 << 12);
    }

    #[tokio::test]
    async fn failed_chunk_stops_the_batch() {
        let (domain, mut hv) = connect(Config::default());
        let all = entries(1021);
        let (frames, result) = hv
            .serve_n(domain.set_page_access(0, &all), 2, |i, _| {
                if i == 1 {
                    FakeHypervisor::err_body(-22)
                } else {
                    FakeHypervisor::ok_body(&[])
                }
            })
            .await;
        assert!(matches!(
            result,
            Err(Error::Remote(RemoteErrno::InvalidArgument))
        ));
        assert_eq!(frames.len(), 2);
        assert!(hv.try_recv_within(std::time::Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn get_access_concatenates_chunks() {
        let (domain, mut hv) = connect(Config::default());
        let gpas: Vec<u64> = (0..1500).map(|i| i << 12).collect();
        let (frames, result) = hv
            .serve_n(domain.get_page_access(0, &gpas), 2, |_, req| {
                let batch = BatchBody::parse(&req.body, 8).unwrap();
                FakeHypervisor::ok_body(&vec![Access::RWX.bits(); usize::from(batch.count)])
            })
            .await;
        let access = result.unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(access.len(), 1500);
        assert!(access.iter().all(|a| *a == Access::RWX));
    }

    #[tokio::test]
    async fn write_bitmaps_roundtrip_through_fake() {
        let (domain, mut hv) = connect(Config::default());
        let (frame, result) = hv
            .serve(
                domain.set_page_write_bitmap(
                    1,
                    &[WriteBitmapEntry {
                        gpa: 0x5000,
                        bitmap: 0x0000_ffff,
                    }],
                ),
                |_| FakeHypervisor::ok_body(&[]),
            )
            .await;
        result.unwrap();
        let batch = BatchBody::parse(&frame.body, WriteBitmapEntry::SIZE).unwrap();
        let mut r = Reader::new(batch.elements);
        assert_eq!((r.u64().unwrap(), r.u32().unwrap()), (0x5000, 0xffff));

        let (_, result) = hv
            .serve(domain.get_page_write_bitmap(1, &[0x5000]), |_| {
                FakeHypervisor::ok_body(&0x0000_ffffu32.to_le_bytes())
            })
            .await;
        assert_eq!(result.unwrap(), vec![0xffff]);
    }

    #[tokio::test]
    async fn empty_batch_sends_nothing() {
        let (domain, mut hv) = connect(Config::default());
        domain.set_page_access(0, &[]).await.unwrap();
        assert!(domain.get_page_access(0, &[]).await.unwrap().is_empty());
        assert!(hv.try_recv_within(std::time::Duration::from_millis(20)).await.is_none());
    }
}
