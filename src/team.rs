/// One process participating in the collectives.
pub type Rank = usize;

/// One logical participant. Several images may share a rank (one per
/// thread); an image's buffers always live on its owning rank.
pub type Image = usize;

/// A collective team. Only the implicit all-image team exists in this
/// engine; the argument is kept in every signature so call sites read
/// like the eventual multi-team interface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Team(u32);

impl Team {
    /// The team of every image in the job.
    pub const ALL: Team = Team(0);

    pub(crate) fn id(&self) -> u32 {
        self.0
    }

    pub(crate) fn lookup(id: u32) -> Team {
        if id != 0 {
            panic!("non-zero team id passed, but teams are not implemented");
        }
        Team::ALL
    }
}

/// The image-to-rank mapping, built once at init from the caller's
/// images-per-rank array.
pub(crate) struct ImageMap {
    all_images: Vec<usize>,
    all_offset: Vec<usize>,
    image_to_rank: Vec<Rank>,
    total_images: usize,
    max_images: usize,
    my_rank: Rank,
    my_images: usize,
    my_offset: usize,
}

impl ImageMap {
    pub fn build(images: &[usize], my_rank: Rank) -> ImageMap {
        assert!(my_rank < images.len());

        let mut all_offset = Vec::with_capacity(images.len());
        let mut total_images = 0;
        let mut max_images = 0;
        for &count in images {
            assert!(count > 0, "every rank must host at least one image");
            all_offset.push(total_images);
            total_images += count;
            max_images = max_images.max(count);
        }

        let mut image_to_rank = Vec::with_capacity(total_images);
        for (rank, &count) in images.iter().enumerate() {
            for _ in 0..count {
                image_to_rank.push(rank);
            }
        }

        ImageMap {
            all_images: images.to_vec(),
            my_images: images[my_rank],
            my_offset: all_offset[my_rank],
            all_offset,
            image_to_rank,
            total_images,
            max_images,
            my_rank,
        }
    }

    pub fn ranks(&self) -> usize {
        self.all_images.len()
    }

    pub fn my_rank(&self) -> Rank {
        self.my_rank
    }

    pub fn total_images(&self) -> usize {
        self.total_images
    }

    pub fn max_images(&self) -> usize {
        self.max_images
    }

    /// Count of images hosted on this rank.
    pub fn my_images(&self) -> usize {
        self.my_images
    }

    /// Count of images on ranks before this one.
    pub fn my_offset(&self) -> usize {
        self.my_offset
    }

    pub fn images_of(&self, rank: Rank) -> usize {
        self.all_images[rank]
    }

    pub fn offset_of(&self, rank: Rank) -> usize {
        self.all_offset[rank]
    }

    pub fn rank_of_image(&self, image: Image) -> Rank {
        assert!(image < self.total_images, "image out of range");
        self.image_to_rank[image]
    }

    /// True if `image` is hosted on this rank.
    pub fn image_is_local(&self, image: Image) -> bool {
        self.rank_of_image(image) == self.my_rank
    }

    /// Index of this rank's first entry in a per-image address list:
    /// 0 under local addressing, the image offset under single.
    pub fn my_first_index(&self, local_addressing: bool) -> usize {
        if local_addressing {
            0
        } else {
            self.my_offset
        }
    }
}
