pub const WELCOME_TEXT: &str = "\
Welcome to blobfs.

This filesystem is backed by a content-addressed blob store.

  roots/         mutable named trees; mkdir here to create a root
  recent/        file versions committed most recently
  date/          committed file versions grouped by UTC day
  tag/           read-only snapshots of roots, grouped by tag
  sha1-<hex>     any stored blob, by digest (the listed placeholder
                 only shows the form and does not resolve)

Files written under roots/ are stored when they are closed.
";
